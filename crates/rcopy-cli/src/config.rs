use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rcopy_server::{IpAllow, OutputTree, ServerConfig};
use rcopy_transfer::{ControlWord, DEFAULT_CHUNK_CODE, TransferLogger};

/// rcopy - point-to-point file copy over TCP
#[derive(Parser, Debug)]
#[command(name = "rcopy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, global = true, env = "RCOPY_VERBOSE", value_enum, default_value_t = OnOff::Off)]
    pub verbose: OnOff,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen on HOST:PORT and receive files
    On(ServerArgs),
    /// Send files to a listener at HOST:PORT
    To(ClientArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

impl OnOff {
    pub fn enabled(self) -> bool {
        self == OnOff::On
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(value_name = "HOST:PORT")]
    pub addr: String,

    /// Directory receiving the files; must exist
    #[arg(long, env = "RCOPY_OUT_DIR", default_value = ".")]
    pub out_dir: PathBuf,

    /// Recreate the sender's relative directories (off: base names only)
    #[arg(long, env = "RCOPY_KEEP_DIR", value_enum, default_value_t = OnOff::On)]
    pub keep_dir: OnOff,

    /// Chunk size code: 1=8K 2=32K 3=128K 4=512K 5=1M
    #[arg(
        long,
        env = "RCOPY_BUFFER_SIZE",
        default_value_t = DEFAULT_CHUNK_CODE,
        value_parser = clap::value_parser!(u8).range(1..=5)
    )]
    pub buffer_size: u8,

    /// MD5 check after every file
    #[arg(long, env = "RCOPY_CHECKSUM", value_enum, default_value_t = OnOff::On)]
    pub checksum: OnOff,

    /// Admit remotes matching MASK: all, localhost, or a.b.c.d with * and =
    /// parts. Repeatable; any match admits.
    #[arg(long, value_name = "MASK", env = "RCOPY_ALLOW", value_delimiter = ',')]
    pub allow: Vec<String>,
}

impl ServerArgs {
    pub fn control(&self) -> anyhow::Result<ControlWord> {
        Ok(ControlWord::new(self.buffer_size, self.checksum.enabled())?)
    }

    /// Validate everything that can be checked before binding.
    pub fn server_config(&self, logger: Arc<dyn TransferLogger>) -> anyhow::Result<ServerConfig> {
        let control = self.control()?;
        let allow = IpAllow::parse(&self.allow)?;
        let destination = OutputTree::new(&self.out_dir, self.keep_dir.enabled())?;
        Ok(ServerConfig {
            control,
            allow,
            destination: Arc::new(destination),
            logger,
        })
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Listener address
    #[arg(value_name = "HOST:PORT")]
    pub addr: String,

    /// Files to send
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Read more paths from a file, one per line ('-' for stdin)
    #[arg(long, value_name = "PATH")]
    pub files_from: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rcopy_transfer::NullLogger;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_server_defaults() {
        let cli = Cli::try_parse_from(["rcopy", "on", "0.0.0.0:4000"]).unwrap();
        let Command::On(args) = cli.command else {
            panic!("expected on");
        };
        assert_eq!(args.buffer_size, DEFAULT_CHUNK_CODE);
        assert!(args.keep_dir.enabled());
        assert!(args.checksum.enabled());
        assert_eq!(args.control().unwrap(), ControlWord::default());
    }

    #[test]
    fn test_server_options() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from([
            "rcopy", "on", "127.0.0.1:5000", "--out-dir", out, "--keep-dir", "off",
            "--buffer-size", "4", "--checksum", "off", "--allow", "=.=.=.*",
            "--allow", "localhost", "--verbose", "on",
        ])
        .unwrap();
        assert!(cli.verbose.enabled());
        let Command::On(args) = cli.command else {
            panic!("expected on");
        };
        let config = args.server_config(Arc::new(NullLogger)).unwrap();
        assert_eq!(config.control.to_bytes(), [4, 0]);
        assert_eq!(config.allow.masks().len(), 2);
    }

    #[test]
    fn test_server_rejects_bad_values() {
        assert!(Cli::try_parse_from(["rcopy", "on", "h:1", "--buffer-size", "6"]).is_err());
        assert!(Cli::try_parse_from(["rcopy", "on", "h:1", "--keep-dir", "maybe"]).is_err());

        let cli = Cli::try_parse_from(["rcopy", "on", "h:1", "--out-dir", "/nonexistent/rcopy/out"])
            .unwrap();
        let Command::On(args) = cli.command else {
            panic!("expected on");
        };
        assert!(args.server_config(Arc::new(NullLogger)).is_err());

        let cli = Cli::try_parse_from(["rcopy", "on", "h:1", "--out-dir", ".", "--allow", "1.2.3"])
            .unwrap();
        let Command::On(args) = cli.command else {
            panic!("expected on");
        };
        assert!(args.server_config(Arc::new(NullLogger)).is_err());
    }

    #[test]
    fn test_client_args() {
        let cli = Cli::try_parse_from(["rcopy", "to", "host:9", "a.txt", "b/c.txt", "--files-from", "-"])
            .unwrap();
        let Command::To(args) = cli.command else {
            panic!("expected to");
        };
        assert_eq!(args.addr, "host:9");
        assert_eq!(args.files, vec![PathBuf::from("a.txt"), PathBuf::from("b/c.txt")]);
        assert_eq!(args.files_from, Some(PathBuf::from("-")));
    }
}
