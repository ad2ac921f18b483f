//! devctld - supervisor daemon for local dev servers and one-off jobs
//!
//! ```bash
//! devctld start        # foreground
//! devctld start -d     # background
//! devctld stop
//! devctld status
//! ```

fn main() -> anyhow::Result<()> {
    devctld::cli::main()
}
