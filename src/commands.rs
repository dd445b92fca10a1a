//! Command implementations shared by the CLI and the interactive `manage` loop.
//!
//! Each command works on an open [`ImageDb`]; the caller saves afterwards.
//! Questions to the user go through a `confirm` callback so the commands can
//! run without a terminal.

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::core::order::natural_cmp;
use crate::database::{AddOutcome, BackupTarget, ImageDb};

/// What `insert-dir` does with a file, given its distance to the closest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertDecision {
    Skip,
    Add,
    Ask,
}

/// `deny` of `None` never skips. An empty database always adds.
pub fn classify(distance: Option<u32>, accept: u32, deny: Option<u32>) -> InsertDecision {
    let Some(distance) = distance else {
        return InsertDecision::Add;
    };
    if deny.is_some_and(|deny| distance <= deny) {
        InsertDecision::Skip
    } else if distance >= accept {
        InsertDecision::Add
    } else {
        InsertDecision::Ask
    }
}

/// Files directly inside `dir`, in natural order of their names.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Cannot find directory \"{}\"", dir.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read directory {:?}", dir))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

fn require_file(file: &Path) -> Result<()> {
    if !file.is_file() {
        bail!("File doesn't exist \"{}\"", file.display());
    }
    Ok(())
}

fn report_add(outcome: &AddOutcome) {
    match outcome {
        AddOutcome::Added(identifier) => println!("✅ Added {}", identifier),
        AddOutcome::AlreadyPresent(identifier) => {
            println!("   {} is already in the database", identifier)
        }
        AddOutcome::Unreadable(identifier, e) => {
            println!("⚠️  Could not add {}: {}", identifier, e)
        }
    }
}

pub fn init(db: &mut ImageDb) -> Result<()> {
    db.init()?;
    println!("✅ Initialised image folder {}", db.image_folder().display());
    Ok(())
}

/// Counts reported by [`index`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    pub added: usize,
    pub present: usize,
    pub failed: usize,
}

/// Move every file of `dir` into the image folder and add it.
pub fn index(db: &mut ImageDb, dir: &Path) -> Result<IndexSummary> {
    let files = list_files(dir)?;
    println!("▶ Indexing {} file(s) from {}", files.len(), dir.display());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));

    spinner.set_message("Moving files…");
    let mut identifiers = Vec::with_capacity(files.len());
    for file in &files {
        let dest = db.move_to_image_folder(file)?;
        identifiers.push(db.identifier_for(&dest));
        spinner.tick();
    }

    spinner.set_message("Hashing images…");
    let hashes = db.tree()?.hasher().hash_batch(&identifiers);

    let mut summary = IndexSummary::default();
    for (identifier, hash) in identifiers.iter().zip(hashes) {
        match hash {
            Ok(hash) => {
                if db.add_hashed(identifier, hash)? {
                    summary.added += 1;
                } else {
                    summary.present += 1;
                }
            }
            Err(e) => {
                log::warn!("Failed to hash {}: {}", identifier, e);
                summary.failed += 1;
            }
        }
    }
    spinner.finish_with_message("Indexing complete");

    println!(
        "✅ Added {}, already present {}, unreadable {}",
        summary.added, summary.present, summary.failed
    );
    Ok(summary)
}

/// Move a file into the image folder and add it, without checking for
/// similar entries.
pub fn add(db: &mut ImageDb, file: &Path) -> Result<AddOutcome> {
    require_file(file)?;
    let (_, outcome) = db.import(file)?;
    report_add(&outcome);
    Ok(outcome)
}

/// Remove an entry. The file itself is left alone.
pub fn remove(db: &mut ImageDb, file: &Path) -> Result<bool> {
    require_file(file)?;
    let removed = db.remove_image(file)?;
    if removed {
        println!("✅ Removed {}", file.display());
    } else {
        println!("File was not present in the database.");
    }
    Ok(removed)
}

/// Print the entries within `tolerance`, or the closest one if there are none.
pub fn lookup(db: &mut ImageDb, file: &Path, tolerance: u32) -> Result<Option<u32>> {
    require_file(file)?;
    println!("▶ Looking up similar entries with tolerance = {}", tolerance);
    let similar = db.find_similar(file, tolerance)?;
    for (identifier, distance) in &similar {
        println!("   {} (distance {})", identifier, distance);
    }
    if let Some(best) = similar.iter().map(|(_, distance)| *distance).min() {
        return Ok(Some(best));
    }

    println!("No images within the tolerance, searching for the closest match…");
    let result = db.find_closest(file)?;
    match &result.closest {
        Some((identifier, distance)) => println!("   Distance: {}, {}", distance, identifier),
        None => println!("The database is empty."),
    }
    Ok(result.distance())
}

/// Show the closest entry, then ask before adding.
pub fn insert(
    db: &mut ImageDb,
    file: &Path,
    confirm: &mut dyn FnMut(&str) -> Result<bool>,
) -> Result<bool> {
    lookup(db, file, 0)?;
    if !confirm("Add file?")? {
        return Ok(false);
    }
    add(db, file)?;
    Ok(true)
}

/// Counts reported by [`insert_dir`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertSummary {
    pub added: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl InsertSummary {
    /// Count the outcome of an accepted file.
    fn record(&mut self, outcome: &AddOutcome) {
        match outcome {
            AddOutcome::Added(_) => self.added += 1,
            AddOutcome::AlreadyPresent(_) => self.skipped += 1,
            AddOutcome::Unreadable(..) => self.failed += 1,
        }
    }
}

/// Insert every file of `dir`: close matches are skipped, distant ones
/// added, and anything in between is left to `confirm`.
pub fn insert_dir(
    db: &mut ImageDb,
    dir: &Path,
    accept: u32,
    deny: Option<u32>,
    confirm: &mut dyn FnMut(&str) -> Result<bool>,
) -> Result<InsertSummary> {
    if deny.is_some_and(|deny| deny >= accept) {
        bail!("The deny tolerance must be less than the accept tolerance");
    }

    let mut summary = InsertSummary::default();
    for file in list_files(dir)? {
        println!("▶ Checking {}", file.display());
        let result = db.find_closest(&file)?;
        if let Some((identifier, distance)) = &result.closest {
            println!("   Closest distance: {}, {}", distance, identifier);
        }

        let add = match classify(result.distance(), accept, deny) {
            InsertDecision::Skip => false,
            InsertDecision::Add => true,
            InsertDecision::Ask => confirm("Add file?")?,
        };
        if add {
            let (_, outcome) = db.import(&file)?;
            report_add(&outcome);
            summary.record(&outcome);
        } else {
            println!("   Skipping");
            summary.skipped += 1;
        }
    }
    Ok(summary)
}

/// Mark a file as used, adding it first if it is not indexed.
pub fn use_file(db: &mut ImageDb, file: &Path) -> Result<bool> {
    require_file(file)?;
    let mut file = file.to_path_buf();
    if !db.contains_image(&file)? {
        println!("Image is not indexed.");
        let (dest, outcome) = db.import(&file)?;
        report_add(&outcome);
        file = dest;
    }

    let identifier = db.identifier_for(&file);
    let marked = db.mark_used(&identifier)?;
    if marked {
        println!("✅ Marked {} as used", identifier);
    } else {
        println!("{} has already been used.", identifier);
    }
    Ok(marked)
}

pub fn use_all(db: &mut ImageDb, dir: &Path) -> Result<usize> {
    let mut marked = 0;
    for file in list_files(dir)? {
        println!("▶ Using {}", file.display());
        if use_file(db, &file)? {
            marked += 1;
        }
    }
    println!("✅ Finished processing files.");
    Ok(marked)
}

pub fn remove_use(db: &mut ImageDb, file: &Path) -> Result<bool> {
    require_file(file)?;
    let identifier = db.identifier_for(file);
    let removed = db.unmark_used(&identifier)?;
    if removed {
        println!("✅ Removed {} from used", identifier);
    } else {
        println!("{} is not used.", identifier);
    }
    Ok(removed)
}

pub fn choose(db: &mut ImageDb) -> Result<Option<String>> {
    let chosen = db.choose()?;
    match &chosen {
        Some(identifier) => println!("✅ Chosen image: {}", identifier),
        None => println!("There are no unused images."),
    }
    Ok(chosen)
}

pub fn show_used(db: &mut ImageDb) -> Result<Vec<String>> {
    let used = db.used_sorted()?;
    if used.is_empty() {
        println!("No files are used.");
    }
    for identifier in &used {
        println!("{}", identifier);
    }
    Ok(used)
}

pub fn backup(db: &mut ImageDb, target: BackupTarget) -> Result<PathBuf> {
    let output = db.backup(target)?;
    println!("✅ Saved to: {}", output.display());
    Ok(output)
}

pub fn show_json(db: &mut ImageDb) -> Result<()> {
    db.rewrite_all()?;
    println!("✅ Indented copies will be written next to the data files");
    Ok(())
}

/// Split a command line at spaces, keeping double-quoted parts together.
/// Quotes are removed and cannot be escaped.
pub fn split_command(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            ' ' if !quoted => {
                if started {
                    parts.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            _ => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::services::hash::HashError;
    use crate::services::hash::tests::create_test_image;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    fn open_in(dir: &Path) -> ImageDb {
        let overrides = Overrides {
            relative_base: Some(dir.to_path_buf()),
            ..Overrides::default()
        };
        ImageDb::open(dir.join("config.json"), &overrides).unwrap()
    }

    fn inbox_with(dir: &Path, images: &[(&str, bool, u8)]) -> PathBuf {
        let inbox = dir.join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        for (name, vertical, offset) in images {
            create_test_image(&inbox.join(name), 64, 64, *vertical, *offset).unwrap();
        }
        inbox
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(None, 10, Some(2)), InsertDecision::Add);
        assert_eq!(classify(Some(2), 10, Some(2)), InsertDecision::Skip);
        assert_eq!(classify(Some(5), 10, Some(2)), InsertDecision::Ask);
        assert_eq!(classify(Some(10), 10, Some(2)), InsertDecision::Add);
        assert_eq!(classify(Some(0), 10, None), InsertDecision::Ask);
        assert_eq!(classify(Some(0), 0, None), InsertDecision::Add);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("lookup a.png 3"), vec!["lookup", "a.png", "3"]);
        assert_eq!(
            split_command("add  \"my photos/cat 1.png\" "),
            vec!["add", "my photos/cat 1.png"]
        );
        assert_eq!(split_command("use \"\""), vec!["use", ""]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_list_files_natural_order() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["img10.png", "img2.png", "img1.png"] {
            fs::write(temp_dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let names: Vec<String> = list_files(temp_dir.path())
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["img1.png", "img2.png", "img10.png"]);
        assert!(list_files(&temp_dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_index_moves_and_adds() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = inbox_with(temp_dir.path(), &[("a.png", false, 0), ("b.png", true, 0)]);
        fs::write(inbox.join("notes.txt"), b"not an image").unwrap();

        let mut db = open_in(temp_dir.path());
        let summary = index(&mut db, &inbox).unwrap();
        assert_eq!(
            summary,
            IndexSummary {
                added: 2,
                present: 0,
                failed: 1
            }
        );
        assert!(list_files(&inbox).unwrap().is_empty());
        assert_eq!(db.tree().unwrap().len(), 2);
    }

    #[test]
    fn test_insert_respects_confirmation() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = inbox_with(temp_dir.path(), &[("a.png", false, 0)]);
        let mut db = open_in(temp_dir.path());

        let mut questions = 0;
        let mut decline = |_: &str| -> Result<bool> {
            questions += 1;
            Ok(false)
        };
        assert!(!insert(&mut db, &inbox.join("a.png"), &mut decline).unwrap());
        assert_eq!(questions, 1);
        assert!(db.tree().unwrap().is_empty());

        assert!(insert(&mut db, &inbox.join("a.png"), &mut |_: &str| Ok(true)).unwrap());
        assert_eq!(db.tree().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_dir_skips_near_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = inbox_with(
            temp_dir.path(),
            &[("1.png", false, 0), ("2.png", false, 10), ("3.png", true, 0)],
        );
        let mut db = open_in(temp_dir.path());

        let asked = Cell::new(0);
        let mut confirm = |_: &str| -> Result<bool> {
            asked.set(asked.get() + 1);
            Ok(true)
        };
        // 1.png goes into the empty database, 2.png is a near copy of it and
        // 3.png is a different image.
        let summary = insert_dir(&mut db, &inbox, 3, Some(1), &mut confirm).unwrap();
        assert_eq!(
            summary,
            InsertSummary {
                added: 2,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(asked.get(), 0);
        assert!(inbox.join("2.png").exists());

        let err = insert_dir(&mut db, &inbox, 3, Some(3), &mut confirm).unwrap_err();
        assert!(err.to_string().contains("deny"));
    }

    #[test]
    fn test_insert_summary_counts_only_added() {
        let mut summary = InsertSummary::default();
        summary.record(&AddOutcome::Added("image1.png".into()));
        summary.record(&AddOutcome::AlreadyPresent("image1.png".into()));
        summary.record(&AddOutcome::Unreadable(
            "image2.png".into(),
            HashError::Io(std::io::ErrorKind::InvalidData.into()),
        ));
        assert_eq!(
            summary,
            InsertSummary {
                added: 1,
                skipped: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_use_outside_missing_image_folder() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = inbox_with(temp_dir.path(), &[("a.png", false, 0)]);
        let mut db = open_in(temp_dir.path());
        assert!(!db.image_folder().exists());

        assert!(use_file(&mut db, &inbox.join("a.png")).unwrap());
        assert!(db.image_folder().join("image1.png").is_file());
        assert!(db.is_used("image1.png").unwrap());
    }

    #[test]
    fn test_use_choose_and_remove_use() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = inbox_with(temp_dir.path(), &[("a.png", false, 0), ("b.png", true, 0)]);
        let mut db = open_in(temp_dir.path());

        // Using a file that is not indexed imports it first.
        assert!(use_file(&mut db, &inbox.join("a.png")).unwrap());
        assert_eq!(db.tree().unwrap().len(), 1);
        let used_file = db.image_folder().join("image1.png");
        assert!(!use_file(&mut db, &used_file).unwrap());

        add(&mut db, &inbox.join("b.png")).unwrap();
        assert_eq!(choose(&mut db).unwrap(), Some("image2.png".to_string()));
        assert_eq!(choose(&mut db).unwrap(), None);
        assert_eq!(show_used(&mut db).unwrap(), vec!["image1.png", "image2.png"]);

        assert!(remove_use(&mut db, &used_file).unwrap());
        assert!(!remove_use(&mut db, &used_file).unwrap());
        assert_eq!(show_used(&mut db).unwrap(), vec!["image2.png"]);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = open_in(temp_dir.path());
        let err = add(&mut db, &temp_dir.path().join("ghost.png")).unwrap_err();
        assert!(err.to_string().contains("ghost.png"));
    }
}
