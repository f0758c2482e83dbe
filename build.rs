//! Build script generating the `stemrig` man pages.
//!
//! Writes `stemrig.1` plus one `stemrig-<subcommand>.1` page per subcommand
//! into the build output directory for packaging.

use std::env;
use std::io::{self, Write};

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(command: clap::Command) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    Man::new(command).render(&mut buffer)?;
    Ok(buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let raw_out_dir = env::var_os("OUT_DIR")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;
    let out_dir = Utf8PathBuf::from_path_buf(raw_out_dir.into())
        .map_err(|path| io::Error::other(format!("OUT_DIR is not UTF-8: {}", path.display())))?;
    let dir = Dir::open_ambient_dir(&out_dir, ambient_authority())?;

    let root = Cli::command();
    for sub in root.get_subcommands() {
        dir.write(format!("stemrig-{}.1", sub.get_name()), render(sub.clone())?)?;
    }
    dir.write("stemrig.1", render(root)?)?;

    Ok(())
}
