use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use parseapid::server::{ParseServer, ParseServerConfig};
use parseapid_apid::Client;
use parseapid_cache::MemoryCache;
use parseapid_common::{config::Config, internal, logging};

#[derive(Parser)]
#[command(name = "parseapid", version = parseapid::VERSION)]
struct Cli {
    /// Config file
    #[arg(long, default_value = "/etc/sendgrid/parseapid.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    logging::init();

    let cfg = match Config::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            internal!(
                level = ERROR,
                "Unable to load config file '{}': {err}",
                cli.config.display()
            );
            return 1;
        }
    };

    let cache = MemoryCache::new(2 << 20, 4 << 20);

    let apid_addr = format!(
        "{}:{}",
        cfg.get_str("parseapid.APID_SERVER", "127.0.0.1"),
        cfg.get_int("parseapid.APID_PORT", 8082)
    );

    let apid = match Client::new(apid_addr, cache).await {
        Ok(client) => client,
        Err(err) => {
            internal!(level = ERROR, "{err}");
            return 1;
        }
    };

    let server = ParseServer::new(Arc::new(apid), ParseServerConfig::default());

    let smtp_addr = format!(
        "{}:{}",
        cfg.get_str("parseapid.SMTP_INTERFACE", "127.0.0.1"),
        cfg.get_int("parseapid.SMTP_PORT", 25)
    );
    let mgmt_addr = format!(
        "{}:{}",
        cfg.get_str("parseapid.MANAGEMENT_INTERFACE", "127.0.0.1"),
        cfg.get_int("parseapid.MANAGEMENT_PORT", 6970)
    );

    // SIGTERM starts the graceful shutdown; the drain bound lives in the
    // server configuration
    let sig_server = server.clone();
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                internal!(level = INFO, "Received SIGTERM");
                sig_server.shutdown();
            }
            Err(err) => {
                internal!(level = ERROR, "Unable to install SIGTERM handler: {err}");
            }
        }
    });

    match server.listen_and_serve(&smtp_addr, &mgmt_addr).await {
        Ok(()) => 0,
        Err(err) => {
            internal!(level = ERROR, "Error starting parseapid server: {err}");
            1
        }
    }
}
