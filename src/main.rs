use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::{Confirm, Input};
use log::LevelFilter;
use std::path::PathBuf;

use imgdb::commands;
use imgdb::config::{DEFAULT_CONFIG_PATH, Overrides};
use imgdb::database::{BackupTarget, ImageDb};

#[derive(Parser, Debug)]
#[command(name = "imgdb", version, about = "Perceptual image database")]
struct Cli {
    /// Config file
    #[arg(long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Database file, overriding the config
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Image folder, overriding the config
    #[arg(long, global = true, value_name = "DIR")]
    folder: Option<PathBuf>,

    /// Usage file, overriding the config
    #[arg(long = "usefile", global = true, value_name = "FILE")]
    usage_file: Option<PathBuf>,

    /// Base directory for relative paths in the config
    #[arg(long, global = true, value_name = "DIR")]
    relative_base: Option<PathBuf>,

    /// Also write indented `.json` copies of the data files
    #[arg(long, global = true)]
    show_json: bool,

    /// Log progress at info level (otherwise RUST_LOG applies)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the config, an empty database and usage file, and the image folder
    Init,

    /// Move every file of a directory into the image folder and add it
    Index { dir: PathBuf },

    /// Move a file into the image folder and add it
    Add { file: PathBuf },

    /// Remove a file from the database, leaving the file in place
    Remove { file: PathBuf },

    /// List entries similar to a file, or the closest one
    Lookup {
        file: PathBuf,
        #[arg(default_value_t = 0)]
        tolerance: u32,
    },

    /// Show the closest entry and ask before adding a file
    Insert { file: PathBuf },

    /// Insert a directory, skipping near duplicates and adding distinct images
    InsertDir {
        dir: PathBuf,
        /// Distances at or above this are added without asking
        accept: u32,
        /// Distances at or below this are skipped without asking
        deny: Option<u32>,
    },

    /// Mark a file as used, adding it first if needed
    Use { file: PathBuf },

    /// Mark every file of a directory as used
    UseAll { dir: PathBuf },

    /// Unmark a file as used
    RemoveUse { file: PathBuf },

    /// Pick an unused image and mark it as used
    Choose,

    /// List the used images
    ShowUsed,

    /// Write a `.bak` copy of the usage file or the database
    Backup {
        #[arg(value_enum)]
        target: Target,
    },

    /// Rewrite the data files with indented `.json` copies
    ShowJson,

    /// Read commands interactively until `exit`
    Manage,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    Used,
    Db,
}

impl From<Target> for BackupTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Used => BackupTarget::Used,
            Target::Db => BackupTarget::Database,
        }
    }
}

/// One line of input in manage mode.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, name = "imgdb", disable_version_flag = true)]
struct ManageLine {
    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::builder().filter_level(LevelFilter::Info).init();
    } else {
        env_logger::init();
    }

    let overrides = Overrides {
        database: cli.database,
        folder: cli.folder,
        usage_file: cli.usage_file,
        relative_base: cli.relative_base,
        show_json: cli.show_json,
    };
    let mut db = ImageDb::open(&cli.config, &overrides)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;

    match cli.command {
        Command::Manage => manage(&mut db),
        command => {
            run(&mut db, command)?;
            db.save().context("Failed to save the database")
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

fn run(db: &mut ImageDb, command: Command) -> Result<()> {
    match command {
        Command::Init => commands::init(db)?,
        Command::Index { dir } => {
            commands::index(db, &dir)?;
        }
        Command::Add { file } => {
            commands::add(db, &file)?;
        }
        Command::Remove { file } => {
            commands::remove(db, &file)?;
        }
        Command::Lookup { file, tolerance } => {
            commands::lookup(db, &file, tolerance)?;
        }
        Command::Insert { file } => {
            commands::insert(db, &file, &mut confirm)?;
        }
        Command::InsertDir { dir, accept, deny } => {
            commands::insert_dir(db, &dir, accept, deny, &mut confirm)?;
        }
        Command::Use { file } => {
            commands::use_file(db, &file)?;
        }
        Command::UseAll { dir } => {
            commands::use_all(db, &dir)?;
        }
        Command::RemoveUse { file } => {
            commands::remove_use(db, &file)?;
        }
        Command::Choose => {
            commands::choose(db)?;
        }
        Command::ShowUsed => {
            commands::show_used(db)?;
        }
        Command::Backup { target } => {
            commands::backup(db, target.into())?;
        }
        Command::ShowJson => commands::show_json(db)?,
        Command::Manage => println!("Already in manage mode."),
    }
    Ok(())
}

/// Interactive mode: each line is a command, saved as soon as it finishes.
fn manage(db: &mut ImageDb) -> Result<()> {
    loop {
        let line: String = Input::new()
            .with_prompt("Enter command")
            .allow_empty(true)
            .interact_text()?;
        let args = commands::split_command(&line);
        if args.first().is_some_and(|arg| arg == "exit") {
            return Ok(());
        }
        if args.is_empty() {
            continue;
        }

        let command = match ManageLine::try_parse_from(args) {
            Ok(line) => line.command,
            Err(e) => {
                let _ = e.print();
                continue;
            }
        };
        if let Err(e) = run(db, command).and_then(|()| Ok(db.save()?)) {
            eprintln!("⚠️  A problem occurred while executing the command: {:#}", e);
        }
    }
}
