use std::path::Path;

use chrono::Utc;
use parkwell::adapters::db::{ensure_spots, open_connection, run_migrations, schema_version};

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut path = if cfg!(windows) {
        ".\\data\\parkwell_test.db".to_string()
    } else {
        "./data/parkwell_test.db".to_string()
    };
    let mut spots: Vec<String> = ["1", "2", "3", "4"].map(String::from).to_vec();
    let mut force = false;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--path" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--path requires a value".to_string());
                };
                path = value.clone();
                index += 2;
            }
            "--spots" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--spots requires a comma separated list".to_string());
                };
                spots = value
                    .split(',')
                    .map(str::trim)
                    .filter(|spot| !spot.is_empty())
                    .map(String::from)
                    .collect();
                index += 2;
            }
            "--force" => {
                force = true;
                index += 1;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let path_ref = Path::new(&path);
    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if force && path_ref.exists() {
        std::fs::remove_file(path_ref)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let seeded = ensure_spots(&connection, &spots, Utc::now()).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;

    println!("created/updated test db at: {path}");
    println!("schema version: {version}");
    println!("spots seeded: {seeded} (configured: {})", spots.join(","));
    Ok(())
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--spots 1,2,3,4] [--force]");
    println!();
    println!("Options:");
    println!(
        "  --path <file>   target sqlite file (default: .\\\\data\\\\parkwell_test.db on Windows)"
    );
    println!("  --spots <list>  spot numbers to seed as available (default: 1,2,3,4)");
    println!("  --force         delete existing file before creating");
}
