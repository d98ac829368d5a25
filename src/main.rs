//! pagedb - command line tool for paged object database files

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pagedb::database::{Database, DatabaseConfig};
use pagedb::record::{Record, Value};
use pagedb::storage::CacheConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// pagedb - inspect and exercise a paged object database
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database file
    #[arg(short = 'f', long, default_value = "./pagedb.db")]
    file: PathBuf,

    /// Cache size in megabytes
    #[arg(long, default_value = "8")]
    cache_mb: usize,

    /// Lock timeout in seconds (0 waits forever)
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Write pages back on their last unlock
    #[arg(long)]
    write_through: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new database file
    Create {
        /// Page size in bytes
        #[arg(short, long, default_value = "4096")]
        page_size: usize,

        /// Free-form description stored in the file
        #[arg(long)]
        description: Option<String>,
    },
    /// Show file identity, contents and counters
    Info,
    /// Store an object built from key=value fields
    Put {
        /// Object class
        #[arg(short, long)]
        class: Option<String>,

        /// Replace the object with this id instead of adding one
        #[arg(long)]
        id: Option<i64>,

        /// Fields as key=value
        fields: Vec<String>,
    },
    /// Print an object (or the root object when no id is given)
    Get { id: Option<i64> },
    /// Delete an object
    Delete { id: i64 },
    /// List stored ids
    List,
    /// Run concurrent add/get/update/delete workers
    Stress {
        #[arg(short, long, default_value = "4")]
        workers: usize,

        #[arg(short, long, default_value = "1000")]
        operations: usize,

        #[arg(long)]
        seed: Option<u64>,
    },
}

impl Args {
    fn config(&self) -> DatabaseConfig {
        let timeout = Duration::from_secs(self.timeout);
        DatabaseConfig {
            cache: CacheConfig {
                cache_size: self.cache_mb * 1024 * 1024,
                lock_timeout: timeout,
                write_through: self.write_through,
                ..CacheConfig::default()
            },
            lock_timeout: timeout,
            ..DatabaseConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = args.config();
    let Args { file, command, .. } = args;
    match command {
        Command::Create {
            page_size,
            description,
        } => {
            let config = DatabaseConfig {
                page_size,
                description,
                ..config
            };
            let db = Database::create(&file, config).context("Failed to create database")?;
            println!("Created {} ({})", file.display(), db.context().uid());
            db.close()?;
        }
        Command::Info => {
            let db = open(&file, config)?;
            print_info(&db)?;
        }
        Command::Put { class, id, fields } => {
            let db = open(&file, config)?;
            let mut record = parse_record(class, &fields)?;
            match id {
                Some(id) => {
                    record.id = Some(id);
                    match db.update(&record)? {
                        Some(version) => println!("Updated #{} to version {}", id, version),
                        None => bail!("No object with id {}", id),
                    }
                }
                None => {
                    let id = db.add(&mut record)?;
                    println!("Added #{}", id);
                }
            }
            db.close()?;
        }
        Command::Get { id } => {
            let db = open(&file, config)?;
            let record = match id {
                Some(id) => db.get(id)?,
                None => db.context().get_root()?,
            };
            match record {
                Some(record) => println!("{}", record),
                None => println!("(none)"),
            }
        }
        Command::Delete { id } => {
            let db = open(&file, config)?;
            if db.delete(id)? {
                println!("Deleted #{}", id);
            } else {
                println!("No object with id {}", id);
            }
            db.close()?;
        }
        Command::List => {
            let db = open(&file, config)?;
            for id in db.context().ids()? {
                println!("{}", id);
            }
        }
        Command::Stress {
            workers,
            operations,
            seed,
        } => {
            let db = Arc::new(open(&file, config)?);
            stress(Arc::clone(&db), workers, operations, seed).await?;
            print_info(&db)?;
            db.close()?;
        }
    }

    Ok(())
}

fn open(file: &Path, config: DatabaseConfig) -> Result<Database> {
    Database::open(file, config).context("Failed to open database")
}

fn parse_record(class: Option<String>, fields: &[String]) -> Result<Record> {
    let mut record = Record {
        class,
        ..Record::new()
    };
    for field in fields {
        let Some((name, value)) = field.split_once('=') else {
            bail!("Field {:?} is not key=value", field);
        };
        record.set(name.trim(), Value::parse(value.trim()));
    }
    Ok(record)
}

fn print_info(db: &Database) -> Result<()> {
    let context = db.context();
    let control = context.control();
    let (objects, pages) = db.statistics();

    println!("File:        {}", db.path().display());
    println!("Uid:         {}", context.uid());
    if let Some(description) = context.description() {
        println!("Description: {}", description);
    }
    println!("Objects:     {}", context.object_count());
    println!("Next id:     {}", control.next_id);
    println!("Pages:       {}", db.cache().page_count());
    println!("Free pages:  {}", context.free_pages()?.len());
    println!("Index depth: {} (black height)", context.check()?);
    println!(
        "Operations:  {} ops, {} pages read, {} pages written",
        objects.count, objects.pages_read, objects.pages_written
    );
    println!(
        "Cache:       {} lookups, {:.1}% hits, {} resident, {} dirty",
        pages.count,
        pages.hit_ratio() * 100.0,
        db.cache().resident_pages(),
        db.cache().dirty_pages()
    );
    Ok(())
}

async fn stress(db: Arc<Database>, workers: usize, operations: usize, seed: Option<u64>) -> Result<()> {
    let seed = seed.unwrap_or_else(rand::random);
    info!(
        "Stress run: {} workers x {} operations, seed {}",
        workers, operations, seed
    );
    let started = Instant::now();

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let db = Arc::clone(&db);
            tokio::task::spawn_blocking(move || run_worker(&db, worker, operations, seed))
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.context("Worker panicked")??;
    }

    println!(
        "Completed {} operations in {:.2?}",
        total,
        started.elapsed()
    );
    Ok(())
}

fn run_worker(db: &Database, worker: usize, operations: usize, seed: u64) -> Result<usize> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(worker as u64));
    let mut live: Vec<(i64, i64)> = Vec::new();

    for i in 0..operations {
        let choice = rng.gen_range(0..10);
        if live.is_empty() || choice < 4 {
            let pad = rng.gen_range(0..4096);
            let mut record = Record::with_class("Stress")
                .with("worker", worker as i64)
                .with("seq", i as i64)
                .with("pad", vec![worker as u8; pad]);
            let id = db.add(&mut record)?;
            live.push((id, i as i64));
        } else if choice < 7 {
            let (id, seq) = live[rng.gen_range(0..live.len())];
            let record = db
                .get(id)?
                .with_context(|| format!("Object {} vanished", id))?;
            if record.get("seq") != Some(&Value::Int(seq)) {
                bail!("Object {} has unexpected contents: {}", id, record);
            }
        } else if choice < 9 {
            let slot = rng.gen_range(0..live.len());
            let (id, _) = live[slot];
            let record = Record::with_class("Stress")
                .with("worker", worker as i64)
                .with("seq", i as i64)
                .with("pad", vec![0u8; rng.gen_range(0..4096)]);
            let record = Record {
                id: Some(id),
                ..record
            };
            if db.update(&record)?.is_none() {
                bail!("Object {} vanished", id);
            }
            live[slot] = (id, i as i64);
        } else {
            let (id, _) = live.swap_remove(rng.gen_range(0..live.len()));
            if !db.delete(id)? {
                bail!("Object {} vanished", id);
            }
        }
    }

    Ok(operations)
}
