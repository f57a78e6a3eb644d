//! Two user agents calling each other over loopback UDP

mod common;

use common::*;
use sipua::application::UserAgent;
use sipua::config::{Config, SipConfig, SipTimerConfig};
use sipua::domain::session::SessionState;
use sipua::infrastructure::protocols::sip::{SipStack, TransactionLayer};
use std::sync::Arc;
use tracing::info_span;

fn sip_config() -> SipConfig {
    SipConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        public_ip: None,
        timers: SipTimerConfig {
            t1_ms: 50,
            t2_ms: 400,
            t4_ms: 500,
        },
        timer_tick_ms: 10,
    }
}

async fn agent(name: &str) -> (Arc<SipStack>, UserAgent, StateLog) {
    let stack = SipStack::bind(&sip_config()).await.unwrap();
    let incoming = stack.take_incoming().unwrap();
    let ua = UserAgent::new(Config::default(), stack.clone(), info_span!("ua", name = name));
    let (handler, log) = state_sink();

    ua.set_invite_state_handler(move |session, request, response, state| {
        if state == SessionState::InviteReceived {
            session.provide_answer(sdp(4000));
            session.provisional(180, "Ringing").unwrap();
            session.accept(200).unwrap();
        }
        handler(session, request, response, state);
    });
    ua.serve(incoming);
    (stack, ua, log)
}

#[tokio::test]
async fn test_call_over_loopback() {
    let (alice_stack, alice, mut alice_log) = agent("alice").await;
    let (bob_stack, bob, mut bob_log) = agent("bob").await;

    let bob_addr = bob_stack.local_addr();
    let target = uri(&format!("sip:400@{}", bob_addr));
    let session = alice
        .invite(&profile(), &target, &target, sdp(6000))
        .await
        .unwrap();

    wait_for_state(&mut alice_log, session.id(), SessionState::Confirmed).await;
    wait_for_state(&mut bob_log, session.id(), SessionState::Confirmed).await;
    assert_eq!(audio_port(session.answer()), Some(4000));

    let callee = bob.session(session.id()).unwrap();
    assert_eq!(audio_port(callee.offer()), Some(6000));

    assert_eq!(session.end(0, ""), Ok(SessionState::Terminated));
    wait_for_state(&mut bob_log, session.id(), SessionState::Terminated).await;
    eventually(|| bob.session_count() == 0).await;
    assert_eq!(alice.session_count(), 0);

    alice.shutdown();
    bob.shutdown();
    alice_stack.shutdown();
    bob_stack.shutdown();
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let (alice_stack, alice, mut alice_log) = agent("alice").await;

    // Nobody listens on this port
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = uri(&format!("sip:400@{}", silent.local_addr().unwrap()));
    let session = alice
        .invite(&profile(), &target, &target, sdp(6000))
        .await
        .unwrap();

    // Timer B fires after 64*T1
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        wait_for_state_slow(&mut alice_log, SessionState::Failure).await
    })
    .await
    .unwrap();
    assert_eq!(session.status(), SessionState::Failure);

    alice_stack.shutdown();
}

async fn wait_for_state_slow(log: &mut StateLog, state: SessionState) {
    while let Some((_, seen)) = log.recv().await {
        if seen == state {
            return;
        }
    }
}
