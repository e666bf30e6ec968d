use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conduit_core::{BufferSize, ContextConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the conduit I/O layer")]
pub struct Args {
    /// Stream buffer size in bytes; 0 disables buffering.
    #[arg(short, long, default_value_t = conduit_core::size::DEFAULT_BUFFER_BYTES)]
    pub buffer_size: usize,

    /// Buffer standard output in full instead of per line.
    #[arg(long)]
    pub block_stdout: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report platform configuration.
    Info,
    /// Copy files to standard output.
    Cat {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Back file buffers with anonymous mappings instead of the heap.
        #[arg(short, long)]
        mapped: bool,
    },
    /// Accept one TCP connection and echo it back line by line.
    Echo {
        #[arg(short, long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
    },
}

impl Args {
    pub fn context_config(&self) -> anyhow::Result<ContextConfig> {
        Ok(ContextConfig::default()
            .buffer_size(BufferSize::new(self.buffer_size)?)
            .stdout_line_buffered(!self.block_stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cat_with_options() {
        let args = Args::parse_from(["conduit-probe", "-b", "64", "cat", "--mapped", "a", "b"]);
        assert_eq!(args.buffer_size, 64);
        match args.command {
            Command::Cat { files, mapped } => {
                assert!(mapped);
                assert_eq!(files, vec![PathBuf::from("a"), PathBuf::from("b")]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn maps_onto_context_config() {
        let args = Args::parse_from(["conduit-probe", "--block-stdout", "info"]);
        let config = args.context_config().unwrap();
        assert_eq!(config.default_buffer_size, BufferSize::DEFAULT);
        assert!(!config.stdout_line_buffered);
    }

    #[test]
    fn sentinel_buffer_size_is_rejected() {
        let args = Args::parse_from(["conduit-probe", "-b", &usize::MAX.to_string(), "info"]);
        assert!(args.context_config().is_err());
    }
}
