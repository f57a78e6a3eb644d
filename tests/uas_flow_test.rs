//! Incoming call flows driven through the dispatcher loop

mod common;

use common::*;
use rsip::Method;
use sipua::application::UserAgent;
use sipua::config::Config;
use sipua::domain::session::SessionState;
use sipua::domain::shared::value_objects::CallId;
use sipua::infrastructure::protocols::sip::{IncomingRequest, SipHeaders, SipRequest};
use sipua::SessionError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Span;

struct Harness {
    ua: UserAgent,
    layer: Arc<FakeLayer>,
    inbound: mpsc::UnboundedSender<IncomingRequest>,
    log: StateLog,
}

fn harness() -> Harness {
    let layer = FakeLayer::new();
    let ua = UserAgent::new(Config::default(), layer.clone(), Span::none());
    let (handler, log) = state_sink();
    ua.set_invite_state_handler(handler);
    let (inbound, rx) = mpsc::unbounded_channel();
    ua.serve(rx);
    Harness {
        ua,
        layer,
        inbound,
        log,
    }
}

impl Harness {
    /// Deliver an INVITE and wait for the session it creates
    async fn ring(&mut self, call_id: &str) -> (SipRequest, Arc<FakeServerTransaction>) {
        let invite = remote_request(Method::Invite, call_id, 1, Some(&sdp(6000)));
        let (request, tx) = inbound(invite.clone());
        self.inbound.send(request).unwrap();
        let (id, state) = next_state(&mut self.log).await;
        assert_eq!(id, CallId::new(call_id));
        assert_eq!(state, SessionState::InviteReceived);
        (invite, tx)
    }
}

#[tokio::test]
async fn test_accept_then_ack_then_remote_bye() {
    let mut h = harness();
    let (_, invite_tx) = h.ring("uas-1").await;
    let call_id = CallId::new("uas-1");
    let session = h.ua.session(&call_id).unwrap();
    assert_eq!(audio_port(session.offer()), Some(6000));

    let answer = sdp(4000);
    session.provide_answer(answer.clone());
    assert_eq!(session.accept(200), Ok(SessionState::Answered));
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Answered);

    let responses = invite_tx.responses();
    assert_eq!(responses.len(), 1);
    let ok = &responses[0];
    assert_eq!(ok.status_code(), 200);
    assert_eq!(ok.body(), answer.to_bytes().as_slice());
    assert_eq!(ok.get_headers("Content-Type").len(), 1);
    assert_eq!(ok.contact_uri().as_deref(), Some("sip:100@127.0.0.1:5080"));
    let local_tag = ok.to_tag().unwrap();
    assert_eq!(local_tag, session.local_tag());

    h.inbound.send(inbound_ack("uas-1")).unwrap();
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Confirmed);

    let (bye, bye_tx) = inbound(remote_request(Method::Bye, "uas-1", 2, None));
    h.inbound.send(bye).unwrap();
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Terminated);
    assert_eq!(bye_tx.codes(), vec![200]);
    eventually(|| h.ua.session(&call_id).is_none()).await;
}

#[tokio::test]
async fn test_bye_overtaking_ack_terminates() {
    let mut h = harness();
    let (_, invite_tx) = h.ring("uas-10").await;
    let session = h.ua.session(&CallId::new("uas-10")).unwrap();
    session.provide_answer(sdp(4000));
    assert_eq!(session.accept(200), Ok(SessionState::Answered));
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Answered);

    // The ACK never shows up before the BYE
    let (bye, bye_tx) = inbound(remote_request(Method::Bye, "uas-10", 2, None));
    h.inbound.send(bye).unwrap();
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Confirmed);
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Terminated);

    assert_eq!(bye_tx.codes(), vec![200]);
    assert_eq!(invite_tx.codes(), vec![200]);
    eventually(|| h.ua.session(session.id()).is_none()).await;
}

#[tokio::test]
async fn test_accept_without_answer_sends_nothing() {
    let mut h = harness();
    let (_, invite_tx) = h.ring("uas-2").await;
    let session = h.ua.session(&CallId::new("uas-2")).unwrap();

    assert_eq!(session.accept(200), Err(SessionError::MissingAnswer));
    assert!(invite_tx.responses().is_empty());
    assert_eq!(session.status(), SessionState::InviteReceived);
}

#[tokio::test]
async fn test_ringing_then_busy() {
    let mut h = harness();
    let (_, invite_tx) = h.ring("uas-3").await;
    let session = h.ua.session(&CallId::new("uas-3")).unwrap();

    assert_eq!(session.provisional(180, "Ringing"), Ok(SessionState::WaitingForAnswer));
    assert_eq!(next_state(&mut h.log).await.1, SessionState::WaitingForAnswer);

    assert_eq!(session.reject(486, "Busy Here"), Ok(SessionState::Failure));
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Failure);

    let responses = invite_tx.responses();
    assert_eq!(invite_tx.codes(), vec![180, 486]);
    assert_eq!(responses[1].reason(), "Busy Here");
    assert!(responses[1].body().is_empty());
    assert_eq!(responses[0].to_tag(), responses[1].to_tag());
    assert!(h.ua.session(session.id()).is_none());
}

#[tokio::test]
async fn test_end_before_answer_rejects() {
    let mut h = harness();
    let (_, invite_tx) = h.ring("uas-4").await;
    let session = h.ua.session(&CallId::new("uas-4")).unwrap();

    assert_eq!(session.end(603, "Decline"), Ok(SessionState::Failure));
    assert_eq!(invite_tx.codes(), vec![603]);

    let err = session.end(603, "Decline").unwrap_err();
    assert!(err.is_already_terminated());
    assert_eq!(invite_tx.codes(), vec![603]);
}

#[tokio::test]
async fn test_remote_cancel() {
    let mut h = harness();
    let (invite, invite_tx) = h.ring("uas-5").await;

    let (cancel, cancel_tx) = inbound(cancel_of(&invite));
    h.inbound.send(cancel).unwrap();
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Canceled);

    assert_eq!(cancel_tx.codes(), vec![200]);
    assert_eq!(invite_tx.codes(), vec![487]);
    eventually(|| h.ua.session(&CallId::new("uas-5")).is_none()).await;
}

#[tokio::test]
async fn test_local_bye_after_confirmed() {
    let mut h = harness();
    h.ring("uas-6").await;
    let session = h.ua.session(&CallId::new("uas-6")).unwrap();
    session.provide_answer(sdp(4000));
    session.accept(200).unwrap();
    next_state(&mut h.log).await;
    h.inbound.send(inbound_ack("uas-6")).unwrap();
    assert_eq!(next_state(&mut h.log).await.1, SessionState::Confirmed);

    assert_eq!(session.end(0, ""), Ok(SessionState::Terminated));
    let (bye, destination) = h.layer.request(0);
    assert_eq!(bye.method(), &Method::Bye);
    assert_eq!(bye.uri().to_string(), "sip:400@127.0.0.1:5090");
    assert_eq!(destination, "127.0.0.1:5090");
    assert_eq!(bye.to_tag().as_deref(), Some("remote"));
    assert_eq!(bye.from_tag(), Some(session.local_tag()));
}

#[tokio::test]
async fn test_handler_may_answer_reentrantly() {
    let layer = FakeLayer::new();
    let ua = UserAgent::new(Config::default(), layer.clone(), Span::none());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    ua.set_invite_state_handler(move |session, _, _, state| {
        // The handler observes the state it is told about
        let _ = seen_tx.send((state, session.status()));
        if state == SessionState::InviteReceived {
            session.provide_answer(sdp(4000));
            session.accept(200).unwrap();
        }
    });
    let (inbound_tx, rx) = mpsc::unbounded_channel();
    ua.serve(rx);

    let (invite, invite_tx) = inbound(remote_request(Method::Invite, "uas-7", 1, Some(&sdp(6000))));
    inbound_tx.send(invite).unwrap();

    let first = tokio::time::timeout(std::time::Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(std::time::Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.0, SessionState::InviteReceived);
    assert_eq!(second, (SessionState::Answered, SessionState::Answered));
    assert_eq!(invite_tx.codes(), vec![200]);
}

#[tokio::test]
async fn test_reinvite_and_unknown_requests() {
    let mut h = harness();
    h.ring("uas-8").await;

    let (reinvite, reinvite_tx) = inbound(remote_request(Method::Invite, "uas-8", 2, Some(&sdp(6002))));
    h.inbound.send(reinvite).unwrap();
    let (options, options_tx) = inbound(remote_request(Method::Options, "uas-9", 1, None));
    h.inbound.send(options).unwrap();
    let (info, info_tx) = inbound(remote_request(Method::Info, "uas-8", 3, None));
    h.inbound.send(info).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while info_tx.codes().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(reinvite_tx.codes(), vec![488]);
    assert_eq!(options_tx.codes(), vec![200]);
    assert!(options_tx.responses()[0].header("Allow").unwrap().contains("INVITE"));
    assert_eq!(info_tx.codes(), vec![501]);
    assert_eq!(h.ua.session(&CallId::new("uas-8")).unwrap().status(), SessionState::InviteReceived);
}
