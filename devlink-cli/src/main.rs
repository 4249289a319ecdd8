//! Command-line client for the device-linking network.
//!
//! Two modes:
//! * `link` — generate a fresh rendezvous path, print the join URI a
//!   scanning device would consume (QR rendering itself is an external
//!   collaborator), drive the rendezvous handshake and join-message state
//!   machine to completion, and persist the linked identity.
//! * `run` — the steady-state client: dial the mediator, authenticate,
//!   reflect, and speak the chat-server protocol through the proxy channel
//!   whenever this device is promoted to leader. Reconnects with backoff on
//!   any unexpected close.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use devlink_core::dedupe::DedupeSet;
use devlink_core::directory::ContactDirectory;
use devlink_core::orchestrator::{Session, SessionEvent};
use devlink_core::storage::IdentityStore;
use devlink_core::supervisor::{ClosedReason, Supervisor};
use devlink_core::ClientConfig;
use devlink_crypto::DeviceGroupKeys;
use devlink_core::blob::BlobKey;
use devlink_core::storage;
use devlink_join::qr::JoinRequest;
use devlink_join::wire as join_wire;
use devlink_proto::{authentication, csp, mediator};
use devlink_net::blob::BlobClient;
use devlink_net::mediator::MediatorSocket;
use devlink_net::rendezvous::RendezvousSocket;
use devlink_net::urls;

#[derive(Parser, Debug)]
#[command(name = "devlink-cli", about = "Linked-device client: join via rendezvous, then run against the mediator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Link this device to an existing account via a QR-code rendezvous.
    Link {
        /// Rendezvous relay host, e.g. `rendezvous.example.invalid`.
        #[arg(long, default_value = "rendezvous.example.invalid")]
        rendezvous_host: String,

        /// Directory to persist identity.json / contacts.json / groups.json into.
        #[arg(long, default_value = "./devlink-data")]
        data_dir: PathBuf,
    },
    /// Run the steady-state client against the mediator.
    Run {
        /// Mediator host, e.g. `mediator.example.invalid`.
        #[arg(long, default_value = "mediator.example.invalid")]
        mediator_host: String,

        /// Directory holding the linked identity written by `link`.
        #[arg(long, default_value = "./devlink-data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Link { rendezvous_host, data_dir } => link(&rendezvous_host, &data_dir).await,
        Command::Run { mediator_host, data_dir } => run(&mediator_host, &data_dir).await,
    }
}

// ─── link ─────────────────────────────────────────────────────────────────────

async fn link(rendezvous_host: &str, data_dir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let initiator = authentication::start();
    let join_uri = JoinRequest {
        ak: *initiator.authentication_key(),
        rendezvous_path_hex: initiator.path_id_hex().to_string(),
    }
    .to_uri();
    let url = urls::rendezvous_url(rendezvous_host, initiator.path_id_hex());
    tracing::info!(%join_uri, "render this URI as a QR code on the existing device");
    tracing::info!(%url, "dialing the rendezvous relay");

    let mut socket = RendezvousSocket::connect(&url).await?;

    let hello = socket.recv_frame().await?;
    let (auth_hello, state) = authentication::on_hello(initiator, &hello)?;
    socket.send_frame(&auth_hello).await?;

    let auth = socket.recv_frame().await?;
    let state = authentication::on_auth(state, &auth)?;

    let nominate = socket.recv_frame().await?;
    let mut nominated = authentication::on_nominate(state, &nominate)?;

    tracing::info!(
        path_id = nominated.path_id_hex(),
        verification_hash = %hex::encode(nominated.verification_hash()),
        "rendezvous nominated; compare the verification hash out-of-band"
    );

    let mut awaiting_begin = Some(devlink_join::start());
    let mut awaiting_essential = None;
    let linked_at = chrono::Utc::now().to_rfc3339();

    loop {
        let sealed = socket.recv_frame().await?;
        let plain = nominated.decrypt(&sealed)?;
        let msg = join_wire::decode_message(&plain)?;

        if let Some(state) = awaiting_begin.take() {
            awaiting_essential = Some(state.on_message(&msg)?);
            continue;
        }

        let state = awaiting_essential.take().expect("join session always has a live state");
        match state.on_message(&msg, data_dir, &linked_at)? {
            devlink_join::JoinOutcome::Continue(next) => {
                awaiting_essential = Some(next);
            }
            devlink_join::JoinOutcome::Done { ack, state: done } => {
                // `ack` is the already-encoded Registered message.
                socket.send_frame(&nominated.encrypt(&ack)).await?;
                socket.close().await?;
                tracing::info!(
                    identity = %done.essential_data.identity,
                    contacts = done.essential_data.contacts.len(),
                    groups = done.essential_data.groups.len(),
                    "linked successfully"
                );
                return Ok(());
            }
        }
    }
}

// ─── run ──────────────────────────────────────────────────────────────────────

async fn run(mediator_host: &str, data_dir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig { data_dir: data_dir.clone(), mediator_host: mediator_host.to_string(), ..Default::default() };
    let supervisor = Arc::new(Supervisor::new(
        config.reflect_ack_timeout,
        config.outgoing_ack_timeout,
        config.reconnect_backoff,
    ));

    loop {
        match run_once(&config, supervisor.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                supervisor.teardown(ClosedReason::SessionClosed);
                tracing::warn!(error = %e, backoff = ?supervisor.reconnect_backoff(), "session ended, reconnecting");
                supervisor.wait_reconnect_backoff().await;
            }
        }
    }
}

/// Everything an event handler needs besides the live session itself.
struct EventCtx {
    config: ClientConfig,
    identity: [u8; 8],
    client_key: [u8; 32],
    device_cookie: [u8; 16],
    device_id: u64,
    device_group_id: String,
    blob: BlobClient,
}

/// Bytes of the nested CSP handshake in flight over the proxy channel.
enum CspDriver {
    Idle,
    AwaitingServerHello { state: csp::AwaitingServerHello, buf: Vec<u8> },
    AwaitingLoginAck { state: csp::AwaitingLoginAck, buf: Vec<u8> },
}

async fn run_once(config: &ClientConfig, supervisor: Arc<Supervisor>) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = IdentityStore::load(&config.data_dir)?;
    let first_connect = store.is_first_connect();
    let device_id = store.ensure_device_id()?;
    let keys = DeviceGroupKeys::derive(store.device_group_key());
    let directory = ContactDirectory::load(&config.data_dir)?;

    let url = urls::mediator_url(&config.mediator_host, &keys.dgpk_public);
    tracing::info!(%url, device_id, "dialing the mediator");
    let mut socket = MediatorSocket::connect(&url).await?;

    // Handshake: ServerHello -> ClientHello -> ServerInfo.
    let frame = socket.recv_frame().await?;
    if frame.frame_type != mediator::frame_type::SERVER_HELLO {
        return Err(format!("expected ServerHello, got frame type {:#04x}", frame.frame_type).into());
    }
    let hello = mediator::ServerHello::decode(&frame.payload)?;

    let device_info = serde_json::json!({
        "label": "devlink",
        "platform": std::env::consts::OS,
        "appVersion": env!("CARGO_PKG_VERSION"),
    });
    let (client_hello, state) = mediator::on_server_hello(
        &keys.dgpk_secret,
        &keys.dgdik,
        keys.dgrk,
        device_id,
        first_connect,
        &hello,
        &serde_json::to_vec(&device_info)?,
    );
    socket.send_frame(mediator::frame_type::CLIENT_HELLO, client_hello).await?;

    let frame = socket.recv_frame().await?;
    if frame.frame_type != mediator::frame_type::SERVER_INFO {
        return Err(format!("expected ServerInfo, got frame type {:#04x}", frame.frame_type).into());
    }
    let info = mediator::ServerInfo::decode(&frame.payload)?;
    let (ready, drift) = mediator::on_server_info(state, info, unix_now_secs());
    if let Some(drift) = drift {
        tracing::warn!(%drift, "continuing despite server clock drift");
    }

    let dedupe = DedupeSet::load(config.data_dir.join("incoming-message-dedupe.json"))?;
    let mut session = Session::new(
        *store.client_key(),
        store.identity_bytes(),
        device_id,
        ready,
        dedupe,
        supervisor.clone(),
        directory.contact_book(),
    );
    let mut driver = CspDriver::Idle;
    let ctx = EventCtx {
        config: config.clone(),
        identity: store.identity_bytes(),
        client_key: *store.client_key(),
        device_cookie: *store.device_cookie(),
        device_id,
        device_group_id: hex::encode(keys.dgpk_public)[..8].to_string(),
        blob: BlobClient::new(),
    };
    let mut keepalive = tokio::time::interval(Duration::from_secs(180));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                supervisor.teardown(ClosedReason::Shutdown);
                socket.close().await.ok();
                return Ok(());
            }
            _ = keepalive.tick() => {
                if session.has_csp() {
                    let frame = session.compose_echo_request(&[])?;
                    socket.send_frame(frame.frame_type, frame.payload).await?;
                }
            }
            frame = socket.recv_frame() => {
                let frame = frame?;
                let (events, outgoing) = session.on_mediator_frame(frame.frame_type, &frame.payload);
                for out in outgoing {
                    socket.send_frame(out.frame_type, out.payload).await?;
                }
                for event in events {
                    handle_event(event, &ctx, &mut session, &mut driver, &mut socket).await?;
                }
            }
        }
    }
}

async fn handle_event(
    event: SessionEvent,
    ctx: &EventCtx,
    session: &mut Session,
    driver: &mut CspDriver,
    socket: &mut MediatorSocket,
) -> Result<(), Box<dyn std::error::Error>> {
    match event {
        SessionEvent::PromotedToLeader => {
            let (hello, state) = csp::start(
                ctx.identity,
                ctx.client_key,
                ctx.device_id,
                ctx.device_cookie,
                ctx.config.client_info.clone(),
            );
            let frame = Session::proxy_frame_raw(hello);
            socket.send_frame(frame.frame_type, frame.payload).await?;
            *driver = CspDriver::AwaitingServerHello { state, buf: Vec::new() };
            tracing::info!("promoted to leader, chat-server handshake started");
        }
        SessionEvent::HandshakeBytes(bytes) => {
            advance_csp_driver(driver, bytes, session, socket).await?;
        }
        SessionEvent::Inbound(msg) => {
            tracing::info!(
                sender = %String::from_utf8_lossy(&msg.sender),
                message_id = msg.message_id,
                kind = msg.kind,
                bytes = msg.body.len(),
                "inbound message"
            );
            if let Err(e) = fetch_inbound_media(ctx, &msg).await {
                tracing::warn!(error = %e, message_id = msg.message_id, "failed to fetch inbound media");
            }
        }
        SessionEvent::DuplicateDropped { sender, message_id } => {
            tracing::debug!(sender = %String::from_utf8_lossy(&sender), message_id, "duplicate dropped");
        }
        SessionEvent::OutgoingAcked { receiver, message_id } => {
            tracing::debug!(%receiver, message_id, "outgoing message acknowledged");
        }
        SessionEvent::ReflectAcked { reflect_id } => {
            tracing::debug!(reflect_id, "reflection acknowledged");
        }
        SessionEvent::ReflectionQueueDry => {
            tracing::debug!("reflection queue dry");
        }
        SessionEvent::PeerMessageSent { message_id, message_type, .. } => {
            tracing::debug!(message_id, message_type, "peer device sent a message");
        }
        SessionEvent::MessageUpdated { message_id, incoming } => {
            tracing::debug!(message_id, incoming, "message updated");
        }
        SessionEvent::ContactSynced { identity } => {
            tracing::info!(%identity, "contact synced from a peer device");
        }
        SessionEvent::Sync(kind) => {
            tracing::debug!(?kind, "sync envelope received");
        }
    }
    Ok(())
}

async fn advance_csp_driver(
    driver: &mut CspDriver,
    bytes: Vec<u8>,
    session: &mut Session,
    socket: &mut MediatorSocket,
) -> Result<(), Box<dyn std::error::Error>> {
    match std::mem::replace(driver, CspDriver::Idle) {
        CspDriver::Idle => {
            tracing::warn!(len = bytes.len(), "proxy bytes with no handshake in flight, dropping");
        }
        CspDriver::AwaitingServerHello { state, mut buf } => {
            buf.extend_from_slice(&bytes);
            if buf.len() < 80 {
                *driver = CspDriver::AwaitingServerHello { state, buf };
                return Ok(());
            }
            let rest = buf.split_off(80);
            let (login_box, ext_box, next) = csp::on_server_hello(state, &buf)?;
            let mut login = login_box;
            login.extend_from_slice(&ext_box);
            let frame = Session::proxy_frame_raw(login);
            socket.send_frame(frame.frame_type, frame.payload).await?;
            *driver = CspDriver::AwaitingLoginAck { state: next, buf: Vec::new() };
            if !rest.is_empty() {
                return Box::pin(advance_csp_driver(driver, rest, session, socket)).await;
            }
        }
        CspDriver::AwaitingLoginAck { state, mut buf } => {
            buf.extend_from_slice(&bytes);
            if buf.len() < 32 {
                *driver = CspDriver::AwaitingLoginAck { state, buf };
                return Ok(());
            }
            let rest = buf.split_off(32);
            let (unblock, ready) = csp::on_login_ack(state, &buf)?;
            session.attach_csp(ready);
            let frame = Session::proxy_frame_for(&unblock);
            socket.send_frame(frame.frame_type, frame.payload).await?;
            tracing::info!("chat-server session ready");
            if !rest.is_empty() {
                // Already length-prefixed steady-state frames.
                let (_events, outgoing) = session.on_mediator_frame(mediator::frame_type::PROXY, &rest);
                for out in outgoing {
                    socket.send_frame(out.frame_type, out.payload).await?;
                }
            }
        }
    }
    Ok(())
}

/// Fetch, decrypt, and store the media behind a file message (direct or
/// group). Non-file messages are a no-op.
async fn fetch_inbound_media(
    ctx: &EventCtx,
    msg: &devlink_core::orchestrator::InboundMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    use devlink_core::inbound::{parse_incoming, IncomingContent};

    let file = match parse_incoming(msg.kind, &msg.body)? {
        IncomingContent::File(file) | IncomingContent::GroupFile(_, file) => file,
        _ => return Ok(()),
    };

    let candidates = devlink_core::blob::download_candidates(
        &file.b,
        &ctx.config.blob_public_endpoint,
        ctx.config.blob_mirror_url_template.as_deref(),
        &ctx.device_group_id,
    );
    let ciphertext = ctx.blob.download(&candidates).await?;
    let key = BlobKey::from_hex(&file.k)?;
    let plaintext = key.decrypt_file(&ciphertext)?;

    let sender = String::from_utf8_lossy(&msg.sender).trim_end_matches('\0').to_string();
    let name = file.n.as_deref().unwrap_or("file.bin");
    storage::save_inbound_media(
        &ctx.config.data_dir,
        &sender,
        msg.metadata.created_at_millis,
        msg.message_id,
        name,
        &plaintext,
    )?;
    Ok(())
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
