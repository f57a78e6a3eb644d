use anyhow::{anyhow, Context};
use dashmap::DashMap;
use rsip::Uri;
use sipua::application::{Session, UserAgent};
use sipua::config::{AccountConfig, Config, MediaConfig};
use sipua::domain::account::{AuthInfo, Profile};
use sipua::domain::session::SessionState;
use sipua::domain::shared::value_objects::{CallId, Direction};
use sipua::infrastructure::media::RtpUdpStream;
use sipua::infrastructure::metrics;
use sipua::infrastructure::protocols::sip::{SdpSession, SipStack};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

type Relays = Arc<DashMap<CallId, RtpUdpStream>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting sipua {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).context("failed to load configuration")?;
    info!("Configuration loaded: {:?}", config.sip);
    metrics::describe_metrics();

    let stack = SipStack::bind(&config.sip).await?;
    let incoming = stack
        .take_incoming()
        .ok_or_else(|| anyhow!("incoming request channel already taken"))?;

    let ua = UserAgent::new(config.clone(), stack.clone(), info_span!("ua"));
    let relays: Relays = Arc::new(DashMap::new());

    let media = config.media.clone();
    let handler_relays = relays.clone();
    ua.set_invite_state_handler(move |session, _request, _response, state| {
        on_state(session, state, &media, &handler_relays);
    });
    ua.set_register_state_handler(|state| {
        if state.is_registered() {
            info!("Registered {} for {}s", state.account.uri, state.expiration);
        } else {
            warn!(
                "Registration of {}: {} {}",
                state.account.uri, state.status_code, state.reason
            );
        }
    });
    ua.serve(incoming);

    let profile = profile_from(&config.account)?;
    let recipient = parse_uri(&config.account.recipient)?;

    if let Err(e) = ua.send_register(&profile, &recipient, profile.expires).await {
        error!("REGISTER failed: {}", e);
    }

    if let Some(target) = &config.account.call_target {
        let target = parse_uri(target)?;
        match place_call(&ua, &profile, &target, &recipient, &config.media, &relays).await {
            Ok(session) => info!("Call {} started", session.id()),
            Err(e) => error!("Call to {} failed: {:#}", target, e),
        }
    }

    info!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    if let Err(e) = ua.send_register(&profile, &recipient, 0).await {
        warn!("Unregister failed: {}", e);
    }
    ua.shutdown();
    for relay in relays.iter() {
        relay.value().close();
    }
    stack.shutdown();
    Ok(())
}

/// Auto-answer incoming calls with an RTP echo; release media on teardown
fn on_state(session: &Arc<Session>, state: SessionState, media: &MediaConfig, relays: &Relays) {
    info!("Call {} ({}) => {}", session.id(), session.direction(), state);

    if state == SessionState::InviteReceived && session.direction() == Direction::Incoming {
        let session = session.clone();
        let media = media.clone();
        let relays = relays.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(&session, &media, &relays).await {
                error!("Failed to answer {}: {:#}", session.id(), e);
                let _ = session.reject(500, "Server Internal Error");
            }
        });
    }

    if state.is_terminal() {
        if let Some((_, relay)) = relays.remove(session.id()) {
            relay.close();
        }
    }
}

async fn answer(session: &Arc<Session>, media: &MediaConfig, relays: &Relays) -> anyhow::Result<()> {
    if let Some(offer) = session.offer() {
        info!("Offered payload types {:?} from {:?}", offer.audio_codecs(), offer.audio_addr());
    }
    let relay = start_echo(media).await?;
    let answer = SdpSession::create_audio_session(media.bind_ip, relay.local_addr().port());
    relays.insert(session.id().clone(), relay);

    session.provide_answer(answer);
    session.provisional(180, "Ringing")?;
    session.accept(200)?;
    Ok(())
}

async fn place_call(
    ua: &UserAgent,
    profile: &Profile,
    target: &Uri,
    recipient: &Uri,
    media: &MediaConfig,
    relays: &Relays,
) -> anyhow::Result<Arc<Session>> {
    let relay = start_echo(media).await?;
    let offer = SdpSession::create_audio_session(media.bind_ip, relay.local_addr().port());
    match ua.invite(profile, target, recipient, offer).await {
        Ok(session) => {
            relays.insert(session.id().clone(), relay);
            Ok(session)
        }
        Err(e) => {
            relay.close();
            Err(e.into())
        }
    }
}

/// Bind a relay that sends every packet back where it came from
async fn start_echo(media: &MediaConfig) -> anyhow::Result<RtpUdpStream> {
    let relay = RtpUdpStream::bind(media).await.context("no RTP port available")?;
    let responder = relay.clone();
    relay.start(move |data, from| {
        let _ = responder.try_send(data, from);
    });
    Ok(relay)
}

fn parse_uri(value: &str) -> anyhow::Result<Uri> {
    Uri::try_from(value).map_err(|e| anyhow!("invalid SIP URI {}: {}", value, e))
}

fn profile_from(account: &AccountConfig) -> anyhow::Result<Profile> {
    Ok(Profile::new(
        parse_uri(&account.uri)?,
        account.display_name.clone(),
        AuthInfo {
            auth_user: account.auth_user.clone(),
            password: account.password.clone(),
            realm: account.realm.clone(),
        },
        account.expires,
    ))
}
