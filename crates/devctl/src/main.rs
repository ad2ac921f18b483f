//! devctl - command line client binary.

fn main() -> anyhow::Result<()> {
    devctl_cli::cli::main()
}
