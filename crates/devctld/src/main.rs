//! devctld - devctl daemon binary.

fn main() -> anyhow::Result<()> {
    devctld::cli::main()
}
