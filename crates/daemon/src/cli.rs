use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "titanium", version, about = "Runs legacy Titanium SDK commands")]
pub(crate) struct Args {
    #[arg(long, global = true, default_value = "~/.titanium/daemon.toml")]
    pub(crate) config: String,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Builds a project
    Build(LegacyArgs),
    /// Removes previous build directories
    Clean(LegacyArgs),
    /// Builds and runs a project
    Run(LegacyArgs),
    /// Lists the platform-specific build options of an SDK
    BuildOptions(BuildOptionsArgs),
    /// Logs into an account
    Login(LoginArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub(crate) struct LegacyArgs {
    /// The directory containing the project; defaults to the current directory
    #[arg(short = 'd', long)]
    pub(crate) project_dir: Option<PathBuf>,
    /// The target build platform
    #[arg(short, long)]
    pub(crate) platform: Option<String>,
    /// SDK to use instead of the one named in tiapp.xml
    #[arg(long)]
    pub(crate) sdk: Option<String>,
    /// Fail instead of prompting for missing values
    #[arg(long, default_value_t = false)]
    pub(crate) no_prompt: bool,
    /// Extra argument for the legacy command, as key=value
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub(crate) args: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub(crate) struct BuildOptionsArgs {
    #[arg(short, long)]
    pub(crate) platform: Option<String>,
    #[arg(long)]
    pub(crate) sdk: Option<String>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub(crate) struct LoginArgs {
    #[arg(long)]
    pub(crate) username: Option<String>,
    /// Log in again even when an account is already active
    #[arg(long, default_value_t = false)]
    pub(crate) force: bool,
    /// Print the account as JSON
    #[arg(long, default_value_t = false)]
    pub(crate) json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_legacy_arguments() {
        let args = Args::parse_from([
            "titanium",
            "build",
            "-p",
            "ios",
            "--arg",
            "target=simulator",
            "--arg",
            "deviceId=ABC",
            "--no-prompt",
            "--log-to-stderr",
        ]);
        let Command::Build(build) = &args.command else {
            panic!("expected build, got {:?}", args.command);
        };
        assert_eq!(build.platform.as_deref(), Some("ios"));
        assert_eq!(build.args, vec!["target=simulator", "deviceId=ABC"]);
        assert!(build.no_prompt);
        assert!(args.log_to_stderr);
    }

    #[test]
    fn login_flags() {
        let args = Args::parse_from(["titanium", "--config", "/tmp/t.toml", "login", "--force", "--json"]);
        let Command::Login(login) = args.command else {
            panic!("expected login");
        };
        assert!(login.force && login.json);
        assert_eq!(args.config, "/tmp/t.toml");
    }
}
