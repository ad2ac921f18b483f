//! devctl - client for the local dev-server control plane
//!
//! See `devctl --help` for the subcommands.

fn main() -> anyhow::Result<()> {
    devctl_cli::cli::main()
}
