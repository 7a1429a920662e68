//! Initial ramdisk image tool.
//!
//! `mkinitrd create <dir> -o initrd.img` packs a directory tree into
//! the kernel's initrd format; `mkinitrd list <image>` prints the
//! contents of an existing image.

mod image;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use image::FsTree;

#[derive(Parser)]
#[command(name = "mkinitrd", about = "Create and inspect initrd images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a directory tree into an initrd image.
    Create {
        /// Source directory.
        dir: PathBuf,
        /// Output image path.
        #[arg(short, long, default_value = "initrd.img")]
        output: PathBuf,
        /// Block size in bytes.
        #[arg(short, long, default_value_t = 512)]
        block_size: u32,
    },
    /// List the contents of an initrd image.
    List {
        /// Image path.
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            dir,
            output,
            block_size,
        } => {
            let tree = FsTree::from_directory(&dir)
                .with_context(|| format!("reading source tree {}", dir.display()))?;
            let bytes = tree.write(block_size)?;
            std::fs::write(&output, &bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "{}: {} nodes, {} bytes",
                output.display(),
                tree.node_count(),
                bytes.len()
            );
            Ok(())
        }
        Command::List { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let parsed = image::Image::parse(&bytes)?;
            parsed.print_tree();
            Ok(())
        }
    }
}
