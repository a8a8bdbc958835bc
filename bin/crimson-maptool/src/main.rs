//! Crimson Maptool - offline OsdMap editor
//!
//! Edits a packed OsdMap file: every mutation validates its arguments,
//! bumps the epoch, and rewrites the file from offset zero.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crimson_map::{Address, OsdMap};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "crimson-maptool")]
#[command(about = "Edit Crimson cluster map files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the map
    Show { file: PathBuf },
    /// Create an empty map file
    Create { file: PathBuf },
    /// Add a new osd entry
    AddOsd {
        file: PathBuf,
        /// Osd id
        #[arg(long)]
        osd: u32,
        /// RDMA address (repeatable)
        #[arg(long = "rdma-address")]
        rdma_address: Vec<String>,
        /// IP address (repeatable)
        #[arg(long = "ip-address")]
        ip_address: Vec<String>,
    },
    /// Remove an osd entry
    RemoveOsd {
        file: PathBuf,
        /// Osd id
        #[arg(long)]
        osd: u32,
    },
    /// Add addresses to an existing osd entry
    AddAddrs {
        file: PathBuf,
        /// Osd id
        #[arg(long)]
        osd: u32,
        /// RDMA address (repeatable)
        #[arg(long = "rdma-address")]
        rdma_address: Vec<String>,
        /// IP address (repeatable)
        #[arg(long = "ip-address")]
        ip_address: Vec<String>,
    },
    /// Remove addresses from an existing osd entry
    RemoveAddrs {
        file: PathBuf,
        /// Osd id
        #[arg(long)]
        osd: u32,
        /// RDMA address (repeatable)
        #[arg(long = "rdma-address")]
        rdma_address: Vec<String>,
        /// IP address (repeatable)
        #[arg(long = "ip-address")]
        ip_address: Vec<String>,
    },
}

fn collect_addrs(rdma: Vec<String>, ip: Vec<String>) -> Result<Vec<Address>> {
    if rdma.is_empty() && ip.is_empty() {
        bail!("at least one --rdma-address or --ip-address is required");
    }
    Ok(rdma
        .into_iter()
        .map(Address::rdma)
        .chain(ip.into_iter().map(Address::ip))
        .collect())
}

fn load(file: &Path) -> Result<OsdMap> {
    OsdMap::load(file).with_context(|| format!("failed to read {}", file.display()))
}

fn save(map: &OsdMap, file: &Path) -> Result<()> {
    map.save(file)
        .with_context(|| format!("failed to write {}", file.display()))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Show { file } => {
            let map = load(&file)?;
            print!("{map}");
        }
        Command::Create { file } => {
            let map = OsdMap::new();
            save(&map, &file)?;
            println!("created {}", file.display());
        }
        Command::AddOsd {
            file,
            osd,
            rdma_address,
            ip_address,
        } => {
            let addrs = collect_addrs(rdma_address, ip_address)?;
            let mut map = load(&file)?;
            map.add_osd(osd, addrs)?;
            save(&map, &file)?;
            println!("added osd {osd}\n{map}");
        }
        Command::RemoveOsd { file, osd } => {
            let mut map = load(&file)?;
            map.remove_osd(osd)?;
            save(&map, &file)?;
            println!("removed osd {osd}\n{map}");
        }
        Command::AddAddrs {
            file,
            osd,
            rdma_address,
            ip_address,
        } => {
            let addrs = collect_addrs(rdma_address, ip_address)?;
            let mut map = load(&file)?;
            map.add_addrs(osd, addrs)?;
            save(&map, &file)?;
            println!("added addresses to osd {osd}\n{map}");
        }
        Command::RemoveAddrs {
            file,
            osd,
            rdma_address,
            ip_address,
        } => {
            let addrs = collect_addrs(rdma_address, ip_address)?;
            let mut map = load(&file)?;
            map.remove_addrs(osd, addrs)?;
            save(&map, &file)?;
            println!("removed addresses from osd {osd}\n{map}");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args.command) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("osdmap")
    }

    #[test]
    fn test_create_then_add_then_show() {
        let dir = tempfile::tempdir().unwrap();
        let file = map_path(&dir);

        run(Command::Create { file: file.clone() }).unwrap();

        run(Command::AddOsd {
            file: file.clone(),
            osd: 5,
            rdma_address: vec![],
            ip_address: vec!["10.0.0.5".into()],
        })
        .unwrap();
        run(Command::AddOsd {
            file: file.clone(),
            osd: 2,
            rdma_address: vec![],
            ip_address: vec!["10.0.0.2".into()],
        })
        .unwrap();

        let map = OsdMap::load(&file).unwrap();
        let ids: Vec<u32> = map.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(map.epoch, 2);

        // Adding an existing id fails and leaves the file untouched.
        let err = run(Command::AddOsd {
            file: file.clone(),
            osd: 2,
            rdma_address: vec![],
            ip_address: vec!["10.0.0.99".into()],
        });
        assert!(err.is_err());
        assert_eq!(OsdMap::load(&file).unwrap().epoch, 2);
    }

    #[test]
    fn test_add_osd_requires_an_address() {
        let dir = tempfile::tempdir().unwrap();
        let file = map_path(&dir);
        run(Command::Create { file: file.clone() }).unwrap();

        let err = run(Command::AddOsd {
            file,
            osd: 1,
            rdma_address: vec![],
            ip_address: vec![],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_remove_missing_osd_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = map_path(&dir);
        run(Command::Create { file: file.clone() }).unwrap();

        let err = run(Command::RemoveOsd { file, osd: 3 });
        assert!(err.is_err());
    }

    #[test]
    fn test_addr_edits() {
        let dir = tempfile::tempdir().unwrap();
        let file = map_path(&dir);
        run(Command::Create { file: file.clone() }).unwrap();
        run(Command::AddOsd {
            file: file.clone(),
            osd: 1,
            rdma_address: vec![],
            ip_address: vec!["10.0.0.1".into()],
        })
        .unwrap();

        run(Command::AddAddrs {
            file: file.clone(),
            osd: 1,
            rdma_address: vec!["ib0".into()],
            ip_address: vec![],
        })
        .unwrap();

        // Duplicate address is rejected.
        assert!(run(Command::AddAddrs {
            file: file.clone(),
            osd: 1,
            rdma_address: vec![],
            ip_address: vec!["10.0.0.1".into()],
        })
        .is_err());

        // Absent address is rejected.
        assert!(run(Command::RemoveAddrs {
            file: file.clone(),
            osd: 1,
            rdma_address: vec![],
            ip_address: vec!["10.9.9.9".into()],
        })
        .is_err());

        run(Command::RemoveAddrs {
            file: file.clone(),
            osd: 1,
            rdma_address: vec!["ib0".into()],
            ip_address: vec![],
        })
        .unwrap();

        let map = OsdMap::load(&file).unwrap();
        assert_eq!(map.epoch, 3);
        assert_eq!(map.entry(1).unwrap().addresses.len(), 1);
    }

    #[test]
    fn test_show_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(Command::Show {
            file: map_path(&dir),
        });
        assert!(err.is_err());
    }
}
