//! Command line front end of `cosem-client`

use anyhow::Context;
use clap::Parser;
use dlms_application::{AppSettings, RequestOptions};
use dlms_client::{AppConn, Connection, DlmsConn};
use dlms_core::{DataObject, ObisCode};
use dlms_session::{HdlcSettings, ServerAddressLength};
use log::LevelFilter;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Read one COSEM attribute from a meter
#[derive(Parser, Debug, Clone)]
#[command(name = "cosem-client")]
#[command(version)]
#[command(about = "Associate with a DLMS/COSEM meter and read one attribute")]
pub struct Args {
    /// Meter IP address
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: IpAddr,

    #[arg(long, default_value_t = 4059)]
    pub port: u16,

    /// Verbose: debug logging
    #[arg(long = "v")]
    pub verbose: bool,

    /// Connect, association and request timeout in seconds (0 = none)
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long)]
    pub log_level: Option<LevelFilter>,

    /// Dump HDLC frames
    #[arg(long)]
    pub hdlc_debug: bool,

    /// HDLC over TCP instead of the TCP wrapper
    #[arg(long)]
    pub hdlc: bool,

    /// Application client address
    #[arg(long, default_value_t = 16)]
    pub client: u16,

    #[arg(long, default_value_t = 1)]
    pub logical_device: u16,

    /// HDLC physical device address
    #[arg(long)]
    pub physical_device: Option<u16>,

    /// Low level security password
    #[arg(long, default_value = "12345678")]
    pub password: String,

    /// Logical name, "0.0.1.0.0.255" or "0-0:1.0.0*255"
    #[arg(long, default_value = "0.0.1.0.0.255")]
    pub obis: ObisCode,

    #[arg(long, default_value_t = 8)]
    pub class_id: u16,

    #[arg(long, default_value_t = 2)]
    pub attribute: u8,
}

impl Args {
    fn level(&self) -> LevelFilter {
        match (self.log_level, self.verbose) {
            (Some(level), _) => level,
            (None, true) => LevelFilter::Debug,
            (None, false) => LevelFilter::Warn,
        }
    }

    fn server_address_length(&self) -> ServerAddressLength {
        match self.physical_device {
            None if self.logical_device <= 0x7F => ServerAddressLength::One,
            Some(pd) if self.logical_device <= 0x7F && pd <= 0x7F => ServerAddressLength::Two,
            _ => ServerAddressLength::Four,
        }
    }
}

pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(args.level());
    if args.hdlc_debug {
        builder.filter_module("dlms_session::hdlc", LevelFilter::Trace);
    }
    builder.parse_default_env();
    if let Err(e) = builder.try_init() {
        eprintln!("logger already installed: {}", e);
    }
}

/// Connect, associate, read the attribute and close
pub async fn run(args: &Args) -> anyhow::Result<DataObject> {
    let address = SocketAddr::new(args.ip, args.port);
    let timeout = Duration::from_secs(args.timeout);

    let dconn = if args.hdlc {
        let client = u8::try_from(args.client).context("HDLC client address must fit in one byte")?;
        let mut settings = HdlcSettings {
            server_address_length: args.server_address_length(),
            ..HdlcSettings::default()
        };
        if !timeout.is_zero() {
            settings.snrm_timeout = timeout;
        }
        DlmsConn::hdlc_connect(address, client, args.logical_device, args.physical_device, settings).await
    } else {
        DlmsConn::tcp_connect(address, timeout).await
    }
    .with_context(|| format!("cannot connect to {}", address))?;

    let settings = AppSettings {
        request: RequestOptions::default().with_timeout(timeout),
        ..AppSettings::default()
    };
    let conn = AppConn::connect_with_settings(
        dconn,
        args.client,
        args.logical_device,
        args.password.as_bytes(),
        timeout,
        settings,
    )
    .await
    .context("association failed")?;

    let value = conn.get_attribute(args.class_id, args.obis, args.attribute).await;
    if let Err(e) = conn.close().await {
        log::warn!("{}: close failed: {}", conn.label(), e);
    }
    value.with_context(|| format!("cannot read {}/{}/{}", args.class_id, args.obis, args.attribute))
}
