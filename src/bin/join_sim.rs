//! Join Simulator
//!
//! Plays both ends of an OTAA activation against an in-process Join Server:
//! builds join-requests the way a device would, hands them to the Join
//! Server as a Network Server would, then decrypts and verifies each
//! join-accept with the device's root keys and checks that the device and
//! the Join Server ended up with the same session keys. Useful for testing
//! key provisioning without radio hardware.
//!
//! Usage: cargo run --bin join-sim -- --app-key <hex> [--nwk-key <hex>] [--lorawan-version 1.1]

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;

use lora_join_server::auth::{Authorizer, Context};
use lora_join_server::crypto::{self, compute_join_request_mic, decrypt_join_accept};
use lora_join_server::joinserver::{Components, JoinRequest, JoinServer, JoinServerConfig};
use lora_join_server::keyvault::MemKeyVault;
use lora_join_server::lorawan::encoder::JoinAcceptMessage;
use lora_join_server::lorawan::keys::{AesKey, KeyEnvelope, RootKeys, SessionKeys};
use lora_join_server::lorawan::{
    DevAddr, DlSettings, Eui64, JoinEuiPrefix, JoinRequestMessage, JoinRequestPayload, MacVersion,
    NetId, JOIN_REQUEST_TYPE,
};
use lora_join_server::registry::{
    EndDevice, EndDeviceIdentifiers, MemAppActivationRegistry, MemDeviceRegistry, MemKeyRegistry,
};

const CLUSTER_KEY: &str = "join-sim";

#[derive(Parser)]
#[command(name = "join-sim")]
#[command(about = "Simulate OTAA joins against an in-process Join Server")]
struct Cli {
    #[arg(long, default_value = "1.0.3")]
    lorawan_version: MacVersion,
    #[arg(long, default_value = "70B3D57ED0000001")]
    join_eui: Eui64,
    #[arg(long, default_value = "0004A30B001C0530")]
    dev_eui: Eui64,
    #[arg(long)]
    app_key: AesKey,
    /// Required for LoRaWAN 1.1
    #[arg(long)]
    nwk_key: Option<AesKey>,
    #[arg(long, default_value = "000013")]
    net_id: NetId,
    #[arg(long, default_value = "26011F00")]
    dev_addr: DevAddr,
    /// DevNonce of the first join
    #[arg(long, default_value_t = 0)]
    dev_nonce: u16,
    /// Number of joins to run
    #[arg(long, default_value_t = 3)]
    joins: u16,
    /// Replay the first join-request at the end
    #[arg(long)]
    replay: bool,
}

/// Session keys as computed on the device.
struct DeviceKeys {
    f_nwk_s_int_key: AesKey,
    s_nwk_s_int_key: AesKey,
    nwk_s_enc_key: AesKey,
    app_s_key: AesKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let version = cli.lorawan_version;
    if version.is_1_1() && cli.nwk_key.is_none() {
        anyhow::bail!("LoRaWAN 1.1 devices need --nwk-key");
    }

    println!("🔑 LoRaWAN Join Simulator");
    println!("  LoRaWAN: {}", version);
    println!("  JoinEUI: {}", cli.join_eui);
    println!("  DevEUI:  {}", cli.dev_eui);
    println!();

    let js = join_server(&cli).await?;
    let authorizer = Authorizer::cluster([CLUSTER_KEY]);
    let ctx = Context::cluster(CLUSTER_KEY);

    let mut first_request = None;
    for i in 0..cli.joins {
        let dev_nonce = cli.dev_nonce.wrapping_add(i);
        let raw = build_join_request(&cli, dev_nonce)?;
        first_request.get_or_insert_with(|| raw.clone());

        println!("📡 Join-request DevNonce={:04X}", dev_nonce);
        match js.handle_join(&ctx, &authorizer, join_request(&cli, raw)).await {
            Ok(res) => {
                let (join_nonce, keys) = accept(&cli, dev_nonce, &res.raw_payload)?;
                println!("   ✅ Join-accept JoinNonce={:06X}", join_nonce);
                let matched = keys_match(version, &keys, &res.session_keys);
                if matched {
                    println!("   ✅ Session keys match ({})", res.session_keys.session_key_id);
                } else {
                    println!("   ❌ Session keys differ from the device's");
                }
            }
            Err(e) => println!("   ❌ Rejected: {} ({})", e, e.code()),
        }
        println!();
    }

    if let (true, Some(raw)) = (cli.replay, first_request) {
        println!("📡 Replaying first join-request");
        match js.handle_join(&ctx, &authorizer, join_request(&cli, raw)).await {
            Ok(_) => println!("   ⚠️  Replay was accepted"),
            Err(e) => println!("   ✅ Replay rejected: {} ({})", e, e.code()),
        }
        println!();
    }

    println!("✨ Simulation complete!");
    Ok(())
}

async fn join_server(cli: &Cli) -> anyhow::Result<JoinServer> {
    let js = JoinServer::new(
        JoinServerConfig {
            join_eui_prefixes: vec![JoinEuiPrefix::new(cli.join_eui, 64)],
            ..Default::default()
        },
        Components {
            devices: Arc::new(MemDeviceRegistry::new()),
            keys: Arc::new(MemKeyRegistry::new(None)),
            app_activation: Arc::new(MemAppActivationRegistry::new()),
            key_vault: Arc::new(MemKeyVault::default()),
        },
    )?;

    let mut dev = EndDevice::new(EndDeviceIdentifiers {
        application_id: "join-sim".to_string(),
        device_id: "device".to_string(),
        join_eui: cli.join_eui,
        dev_eui: cli.dev_eui,
    });
    dev.lorawan_version = cli.lorawan_version;
    dev.root_keys = Some(RootKeys {
        root_key_id: None,
        app_key: Some(KeyEnvelope::plain(cli.app_key.clone())),
        nwk_key: cli.nwk_key.clone().map(KeyEnvelope::plain),
    });
    js.provision(vec![dev]).await?;
    Ok(js)
}

/// The key protecting join-requests and join-accepts.
fn frame_key(cli: &Cli) -> &AesKey {
    match (&cli.nwk_key, cli.lorawan_version.is_1_1()) {
        (Some(nwk_key), true) => nwk_key,
        _ => &cli.app_key,
    }
}

fn build_join_request(cli: &Cli, dev_nonce: u16) -> anyhow::Result<Vec<u8>> {
    let payload = JoinRequestPayload {
        join_eui: cli.join_eui,
        dev_eui: cli.dev_eui,
        dev_nonce,
    };
    let unsigned = JoinRequestMessage::new(payload.clone(), [0; 4]).encode()?;
    let mic = compute_join_request_mic(frame_key(cli), &unsigned)?;
    Ok(JoinRequestMessage::new(payload, mic).encode()?)
}

fn join_request(cli: &Cli, raw: Vec<u8>) -> JoinRequest {
    JoinRequest {
        dl_settings: DlSettings::new(cli.lorawan_version.is_1_1(), 0, 0),
        rx_delay: 1,
        ..JoinRequest::new(raw, cli.lorawan_version, cli.net_id, cli.dev_addr)
    }
}

/// Decrypt and verify a join-accept as the device, and derive the session
/// keys from it.
fn accept(cli: &Cli, dev_nonce: u16, raw: &[u8]) -> anyhow::Result<(u32, DeviceKeys)> {
    let (mhdr, body) = raw.split_first().context("empty join-accept")?;
    let mut plain = vec![*mhdr];
    plain.extend(decrypt_join_accept(frame_key(cli), body)?);
    let msg = JoinAcceptMessage::parse(&plain)?;
    let signed = msg.payload.build()?;
    let join_nonce = msg.payload.join_nonce;
    let net_id = msg.payload.net_id;

    let keys = match (&cli.nwk_key, cli.lorawan_version.is_1_1()) {
        (Some(nwk_key), true) => {
            let js_int_key = crypto::derive_js_int_key(nwk_key, cli.dev_eui);
            let mic = crypto::compute_join_accept_mic(
                &js_int_key,
                JOIN_REQUEST_TYPE,
                cli.join_eui,
                dev_nonce,
                &signed,
            );
            anyhow::ensure!(mic == msg.mic, "join-accept MIC mismatch");
            DeviceKeys {
                f_nwk_s_int_key: crypto::derive_f_nwk_s_int_key(
                    nwk_key,
                    join_nonce,
                    cli.join_eui,
                    dev_nonce,
                ),
                s_nwk_s_int_key: crypto::derive_s_nwk_s_int_key(
                    nwk_key,
                    join_nonce,
                    cli.join_eui,
                    dev_nonce,
                ),
                nwk_s_enc_key: crypto::derive_nwk_s_enc_key(
                    nwk_key,
                    join_nonce,
                    cli.join_eui,
                    dev_nonce,
                ),
                app_s_key: crypto::derive_app_s_key(
                    &cli.app_key,
                    join_nonce,
                    cli.join_eui,
                    dev_nonce,
                ),
            }
        }
        _ => {
            let mic = crypto::compute_legacy_join_accept_mic(&cli.app_key, &signed);
            anyhow::ensure!(mic == msg.mic, "join-accept MIC mismatch");
            let nwk_s_key =
                crypto::derive_legacy_nwk_s_key(&cli.app_key, join_nonce, net_id, dev_nonce);
            DeviceKeys {
                f_nwk_s_int_key: nwk_s_key.clone(),
                s_nwk_s_int_key: nwk_s_key.clone(),
                nwk_s_enc_key: nwk_s_key,
                app_s_key: crypto::derive_legacy_app_s_key(
                    &cli.app_key,
                    join_nonce,
                    net_id,
                    dev_nonce,
                ),
            }
        }
    };
    Ok((join_nonce, keys))
}

fn keys_match(version: MacVersion, device: &DeviceKeys, issued: &SessionKeys) -> bool {
    let same = |key: &AesKey, envelope: &Option<KeyEnvelope>| {
        matches!(envelope, Some(KeyEnvelope::Plain { key: k }) if k == key)
    };
    let network = if version.is_1_1() {
        same(&device.f_nwk_s_int_key, &issued.f_nwk_s_int_key)
            && same(&device.s_nwk_s_int_key, &issued.s_nwk_s_int_key)
            && same(&device.nwk_s_enc_key, &issued.nwk_s_enc_key)
    } else {
        same(&device.f_nwk_s_int_key, &issued.f_nwk_s_int_key)
    };
    network && same(&device.app_s_key, &issued.app_s_key)
}
