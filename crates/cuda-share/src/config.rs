use clap::{Parser, Subcommand};
use utils::version;

use crate::session::ServeOptions;

#[derive(Parser, Debug)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the driver version and the visible devices
    Info,
    /// Export a freshly filled device buffer and wait for a peer to verify it
    Serve(ServeArgs),
    /// Map a buffer exported by `serve` and verify its contents
    Attach(AttachArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        help = "Ordinal of the device to allocate on",
        env = "CUDA_SHARE_DEVICE",
        default_value = "0"
    )]
    pub device: u32,

    #[arg(
        long,
        help = "Buffer size in bytes",
        env = "CUDA_SHARE_SIZE",
        default_value = "1048576",
        value_parser = parse_size
    )]
    pub size: usize,

    #[arg(
        long,
        help = "Byte to fill the buffer with (decimal or 0x-prefixed hex)",
        default_value = "0xa5",
        value_parser = parse_byte
    )]
    pub pattern: u8,
}

impl From<&ServeArgs> for ServeOptions {
    fn from(args: &ServeArgs) -> Self {
        Self {
            device: args.device,
            size: args.size,
            pattern: args.pattern,
        }
    }
}

#[derive(Parser, Debug)]
pub struct AttachArgs {
    #[arg(
        long,
        help = "Server name printed by `cuda-share serve`",
        env = "CUDA_SHARE_SERVER"
    )]
    pub server: String,

    #[arg(
        long,
        help = "Ordinal of the device to map the buffer on",
        env = "CUDA_SHARE_DEVICE",
        default_value = "0"
    )]
    pub device: u32,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}` is not a byte value: {e}"))
}

fn parse_size(s: &str) -> Result<usize, String> {
    let size: usize = s
        .parse()
        .map_err(|e| format!("`{s}` is not a size in bytes: {e}"))?;
    if size == 0 {
        return Err("size must be greater than zero".to_string());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["cuda-share", "serve"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(
            ServeOptions::from(&args),
            ServeOptions {
                device: 0,
                size: 1 << 20,
                pattern: 0xa5
            }
        );
    }

    #[test]
    fn pattern_accepts_decimal_and_hex() {
        assert_eq!(parse_byte("17"), Ok(17));
        assert_eq!(parse_byte("0xFF"), Ok(255));
        assert!(parse_byte("256").is_err());
        assert!(parse_byte("0xzz").is_err());
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(Cli::try_parse_from(["cuda-share", "serve", "--size", "0"]).is_err());
    }

    #[test]
    fn attach_requires_server() {
        let cli =
            Cli::try_parse_from(["cuda-share", "attach", "--server", "/tmp/x", "--device", "1"])
                .unwrap();
        let Commands::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        assert_eq!(args.server, "/tmp/x");
        assert_eq!(args.device, 1);
    }
}
