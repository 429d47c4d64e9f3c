//! 命令行界面定义
//!
//! 定义了主程序的命令行参数和选项
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "curium")]
#[command(version)]
#[command(about = "Command bus over Redis pub/sub: run a listening node or query the bus")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,

    /// Configuration file path (defaults to searching standard locations)
    #[arg(short, long, default_value = "curium.toml")]
    pub(crate) config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Test configuration file
    Test {
        /// Configuration file path (optional, defaults to curium.toml)
        #[arg(index = 1)]
        config_file: Option<PathBuf>,
    },

    /// Connect a node and execute received commands until Ctrl-C
    Listen {
        /// Extra channel to join, can be repeated
        #[arg(long = "channel")]
        channels: Vec<String>,
    },

    /// Ask every node on the bus for its id
    Nodes {
        /// How long to wait for answers (defaults to node.response_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_channels() {
        let cli = Cli::parse_from(["curium", "listen", "--channel", "a", "--channel", "b"]);
        assert_eq!(cli.config, PathBuf::from("curium.toml"));
        match cli.command {
            Some(Commands::Listen { channels }) => assert_eq!(channels, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_nodes_with_config() {
        let cli = Cli::parse_from(["curium", "--config", "/tmp/x.toml", "nodes", "--timeout-ms", "250"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
        assert!(matches!(
            cli.command,
            Some(Commands::Nodes {
                timeout_ms: Some(250)
            })
        ));
    }

    #[test]
    fn test_no_subcommand_runs_listener() {
        let cli = Cli::parse_from(["curium"]);
        assert!(cli.command.is_none());
    }
}
