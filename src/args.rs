use clap::Parser;
use std::path::PathBuf;

/// realtime-tail - follow a realtime change feed from the terminal
#[derive(Parser, Debug)]
#[command(name = "realtime-tail")]
#[command(version)]
#[command(about = "Print realtime row changes (and typing rosters) as JSON lines", long_about = None)]
pub struct Cli {
    /// TOML config file (defaults apply when omitted)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Realtime server URL, overrides the config file
    #[arg(short = 'u', long = "url")]
    pub url: Option<String>,

    /// Table to follow
    #[arg(short = 't', long = "table")]
    pub table: String,

    /// Schema of the table
    #[arg(long = "schema", default_value = "public")]
    pub schema: String,

    /// Server-side filter; `{user_id}` is replaced with --user
    #[arg(short = 'f', long = "filter")]
    pub filter: Option<String>,

    /// User id to sign in as
    #[arg(long = "user", default_value = "realtime-tail")]
    pub user: String,

    /// Display name announced in typing broadcasts
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Also follow typing indicators of this conversation
    #[arg(long = "typing")]
    pub typing: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Log format (compact, pretty, json)
    #[arg(long = "log-format")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cli = Cli::try_parse_from(["realtime-tail", "--table", "notifications"]).unwrap();
        assert_eq!(cli.table, "notifications");
        assert_eq!(cli.schema, "public");
        assert_eq!(cli.user, "realtime-tail");
        assert!(cli.typing.is_none());
    }

    #[test]
    fn test_parse_full() {
        let cli = Cli::try_parse_from([
            "realtime-tail",
            "-c",
            "realtime.toml",
            "-t",
            "notifications",
            "-f",
            "user_id=eq.{user_id}",
            "--user",
            "u1",
            "--typing",
            "c9",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config.unwrap(), PathBuf::from("realtime.toml"));
        assert_eq!(cli.filter.as_deref(), Some("user_id=eq.{user_id}"));
        assert_eq!(cli.typing.as_deref(), Some("c9"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }

    #[test]
    fn test_table_is_required() {
        assert!(Cli::try_parse_from(["realtime-tail"]).is_err());
    }
}
