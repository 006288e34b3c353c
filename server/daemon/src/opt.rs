#[derive(Debug, Args)]
struct CommonOpt {
    /// Path to the server's configuration file.
    #[clap(short, long = "config", env = "LDAPCATCH_CONFIG")]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(name = "ldapcatchd")]
struct LdapCatchdParser {
    #[command(subcommand)]
    commands: LdapCatchdOpt,
}

#[derive(Debug, Subcommand)]
enum LdapCatchdOpt {
    #[clap(name = "server")]
    /// Start the LDAP responder
    Server(CommonOpt),
    #[clap(name = "configtest")]
    /// Load and check the configuration, without starting the listener.
    ConfigTest(CommonOpt),
    #[clap(name = "version")]
    /// Print the version and exit
    Version(CommonOpt),
}
