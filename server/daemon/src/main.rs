#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use ldapcatchd_core::config::{Configuration, LogLevel, ServerConfig};
use ldapcatchd_core::{certificate_provider_from_config, create_ldap_server, storage_from_config};
use sketching::tracing_forest::traits::*;
use sketching::tracing_forest::util::*;
use sketching::tracing_forest::{self};

include!("./opt.rs");

const DEFAULT_CONFIG_PATH: &str = "/etc/ldapcatch/server.toml";

impl LdapCatchdOpt {
    fn commonopt(&self) -> &CommonOpt {
        match self {
            LdapCatchdOpt::Server(sopt)
            | LdapCatchdOpt::ConfigTest(sopt)
            | LdapCatchdOpt::Version(sopt) => sopt,
        }
    }
}

/// Resolves once the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(target_family = "unix")]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(?e, "Unable to register SIGTERM handler, only ctrl-c will stop the server");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {}
            Some(()) = sigterm.recv() => {}
        }
    }
    #[cfg(target_family = "windows")]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    // Read CLI args, determine what the user has asked us to do.
    let opt = LdapCatchdParser::parse();

    // print the app version and bail
    if let LdapCatchdOpt::Version(_) = &opt.commands {
        println!("ldapcatchd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    };

    let cfg_path = opt
        .commands
        .commonopt()
        .config_path
        .clone()
        .or_else(|| PathBuf::from_str(DEFAULT_CONFIG_PATH).ok());

    let Some(cfg_path) = cfg_path else {
        eprintln!("Unable to start - can not locate any configuration file");
        return ExitCode::FAILURE;
    };

    if !cfg_path.exists() {
        eprintln!(
            "Refusing to run - config file {} does not exist",
            cfg_path.to_str().unwrap_or("<invalid filename>")
        );
        return ExitCode::FAILURE;
    }

    let sconfig = match ServerConfig::new(&cfg_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config Parse failure {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    // We only allow config file for log level now.
    let log_filter: EnvFilter = sconfig.log_level.unwrap_or(LogLevel::Info).into();

    tracing_forest::worker_task()
        .set_global(true)
        .set_tag(sketching::event_tagger)
        // Fall back to stderr
        .map_sender(|sender| sender.or_stderr())
        .build_on(|subscriber| subscriber.with(log_filter))
        .on(async {
            let config = match Configuration::try_from_server_config(&sconfig) {
                Ok(c) => c,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };

            info!("Using config file {:?}", cfg_path);
            info!("{}", config);

            let provider = certificate_provider_from_config(&config);

            if let LdapCatchdOpt::ConfigTest(_) = &opt.commands {
                // The server checks the certificate itself when it starts.
                if let Some(provider) = provider.as_ref() {
                    if let Err(e) = provider.certificate() {
                        error!(?e, "Unable to load the configured TLS certificate");
                        return ExitCode::FAILURE;
                    }
                }
                info!("Configuration is valid");
                return ExitCode::SUCCESS;
            }

            info!("Running in server mode ...");

            let storage = match storage_from_config(&config).await {
                Ok(s) => s,
                Err(e) => {
                    error!(?e, "Unable to open interaction storage");
                    return ExitCode::FAILURE;
                }
            };

            let mut sctx = match create_ldap_server(&config, storage, provider).await {
                Ok(sctx) => sctx,
                Err(e) => {
                    error!(?e, "Failed to start server core!");
                    return ExitCode::FAILURE;
                }
            };

            shutdown_signal().await;
            info!("Signal received, shutting down");
            // Send a broadcast that we are done.
            sctx.shutdown().await;
            info!("Stopped 🛑 ");
            ExitCode::SUCCESS
        })
        .await
}
