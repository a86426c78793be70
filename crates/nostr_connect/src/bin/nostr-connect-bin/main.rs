#![deny(missing_docs)]
#![deny(unsafe_code)]

//! nostr connect client control binary

use nostr_connect_api::dependencies::*;
use nostr_connect_api::prelude::*;
use structopt::StructOpt;

mod cmd_config;
mod cmd_connect_uri;
mod cmd_init;
mod cmd_keygen;
mod cmd_parse;

#[derive(Debug, StructOpt)]
pub(crate) struct OptConnectUri {
    /// Relay the signer should answer on. May be repeated.
    /// Falls back to `default_relays` from the config file.
    #[structopt(short = "r", long = "relay", verbatim_doc_comment)]
    pub relays: Vec<String>,

    /// Application name shown to the user by the signer.
    /// Falls back to `app_name` from the config file.
    #[structopt(short = "n", long, verbatim_doc_comment)]
    pub name: Option<String>,

    /// Requested permissions, for example
    /// "sign_event:1,nip44_encrypt".
    /// Falls back to `perms` from the config file.
    #[structopt(short = "p", long, verbatim_doc_comment)]
    pub perms: Option<String>,
}

#[derive(Debug, StructOpt)]
pub(crate) struct OptParse {
    /// A `nostrconnect://` or `bunker://` uri.
    #[structopt(verbatim_doc_comment)]
    pub uri: String,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Write a default config file. Refuses to overwrite
    /// an existing file.
    #[structopt(verbatim_doc_comment)]
    Init,

    /// Print the effective, validated config as yaml.
    /// Built-in defaults are used if no config file exists.
    #[structopt(verbatim_doc_comment)]
    Config,

    /// Generate a fresh ephemeral keypair and print it
    /// as yaml. The secret is printed in the clear.
    #[structopt(verbatim_doc_comment)]
    Keygen,

    /// Mint a `nostrconnect://` uri for a remote signer to
    /// scan and print only the uri to stdout.
    #[structopt(verbatim_doc_comment)]
    ConnectUri(OptConnectUri),

    /// Parse a connection uri and print its fields as yaml.
    #[structopt(verbatim_doc_comment)]
    Parse(OptParse),
}

#[derive(Debug, StructOpt)]
#[structopt(about = "nostr connect remote signer client")]
struct Opt {
    /// Path to the yaml config file.
    #[structopt(
        short = "c",
        long,
        default_value = "nostr-connect-config.yaml",
        env = "NOSTR_CONNECT_CONFIG"
    )]
    config: std::path::PathBuf,

    /// The subcommand to execute
    #[structopt(subcommand)]
    cmd: Cmd,
}

/// Load the config file, or the defaults if there is none.
async fn get_config(
    config_n: &std::path::Path,
) -> ConnectResult<EngineConfig> {
    match tokio::fs::read_to_string(config_n).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(?config_n, "no config file, using defaults");
            Ok(EngineConfig::default())
        }
        Err(e) => Err(ConfigError::Io(format!(
            "could not read config file {config_n:?}: {e}"
        ))
        .into()),
        Ok(yaml) => Ok(EngineConfig::from_yaml_str(&yaml)?),
    }
}

fn init_tracing() {
    // stdout is reserved for command output
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .compact()
            .finish(),
    );
}

async fn exec() -> ConnectResult<()> {
    init_tracing();
    let Opt { config, cmd } = Opt::from_args();
    match cmd {
        Cmd::Init => cmd_init::exec(config).await,
        Cmd::Config => cmd_config::exec(get_config(&config).await?).await,
        Cmd::Keygen => cmd_keygen::exec().await,
        Cmd::ConnectUri(opt) => {
            cmd_connect_uri::exec(get_config(&config).await?, opt).await
        }
        Cmd::Parse(opt) => cmd_parse::exec(opt).await,
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(e) = exec().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
