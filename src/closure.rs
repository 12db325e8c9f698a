use std::collections::HashMap;

use anyhow::Result;
use slog_scope::info;

use crate::db::{Database, ElfFileRow, PackageSetId};

/// Observer for closure resolution events, invoked before rows are
/// written. Useful for diagnostics and dry runs.
pub trait ClosureCallbacks {
    fn missing(&mut self, file: &ElfFileRow, needed_name: &str);

    /// CHOICES lists all candidates, the chosen one first.
    fn conflict(&mut self, file: &ElfFileRow, needed_name: &str, choices: &[&ElfFileRow]);

    /// When true, resolution runs but nothing is written.
    fn skip_update(&self) -> bool {
        false
    }
}

enum Resolution<'a> {
    Missing,
    Chosen(&'a ElfFileRow),
    /// All matching candidates, the chosen one first.
    Conflict(Vec<&'a ElfFileRow>),
}

// CANDIDATES must already be ordered by (package id, file name); the
// first class/data-compatible entry wins.
fn resolve<'a>(file: &ElfFileRow, candidates: &[&'a ElfFileRow]) -> Resolution<'a> {
    let matching: Vec<&ElfFileRow> = candidates
        .iter()
        .filter(|c| c.ei_class == file.ei_class && c.ei_data == file.ei_data)
        .copied()
        .collect();
    match matching.len() {
        0 => Resolution::Missing,
        1 => Resolution::Chosen(matching[0]),
        _ => Resolution::Conflict(matching),
    }
}

/// Recomputes the soname link closure of a package set: for every ELF
/// file and every soname it needs, the resolving file within the set
/// (restricted to matching ELF class and data encoding), plus records
/// for misses and ambiguous choices.
pub fn update_elf_closure(
    db: &Database,
    set: PackageSetId,
    mut callbacks: Option<&mut dyn ClosureCallbacks>,
) -> Result<()> {
    let files = db.elf_files_in_set(set)?;
    let needed = db.elf_needed_in_set(set)?;

    // soname -> providers, in (package id, file name) order.
    let mut providers: HashMap<&str, Vec<&ElfFileRow>> = HashMap::new();
    for file in &files {
        if let Some(soname) = &file.soname {
            providers.entry(soname).or_default().push(file);
        }
    }

    let skip_update = callbacks
        .as_deref()
        .map(|cb| cb.skip_update())
        .unwrap_or(false);
    if !skip_update {
        db.clear_elf_closure(set)?;
    }

    static NO_NEEDS: Vec<String> = Vec::new();
    for file in &files {
        let needs = needed.get(&file.contents).unwrap_or(&NO_NEEDS);
        for soname in needs {
            let candidates = providers.get(soname.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            match resolve(file, candidates) {
                Resolution::Missing => {
                    if let Some(cb) = callbacks.as_deref_mut() {
                        cb.missing(file, soname);
                    }
                    if !skip_update {
                        db.add_elf_closure(set, file.file, soname, None)?;
                    }
                }
                Resolution::Chosen(chosen) => {
                    if !skip_update {
                        db.add_elf_closure(set, file.file, soname, Some(chosen.file))?;
                    }
                }
                Resolution::Conflict(choices) => {
                    if let Some(cb) = callbacks.as_deref_mut() {
                        cb.conflict(file, soname, &choices);
                    }
                    if !skip_update {
                        db.add_elf_closure(set, file.file, soname, Some(choices[0].file))?;
                        for (position, candidate) in choices.iter().enumerate() {
                            db.add_elf_closure_conflict(
                                set,
                                file.file,
                                soname,
                                candidate.file,
                                position as i32,
                            )?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Refreshes set-wide helper tables after a membership change.
pub fn update_package_set_caches(db: &Database, set: PackageSetId) -> Result<()> {
    info!("updating package set caches");
    update_elf_closure(db, set, None)
}

/// Prints the recorded soname conflicts of a set to standard output.
/// Silent when the set resolves cleanly.
pub fn print_elf_soname_conflicts(db: &Database, set: PackageSetId) -> Result<()> {
    let rows = db.soname_conflicts(set)?;
    let mut current = None;
    for row in &rows {
        let key = (&row.file_name, &row.needed_name);
        if current != Some(key) {
            println!(
                "{} ({}) needs {}:",
                row.file_name, row.package_nevra, row.needed_name
            );
            current = Some(key);
        }
        if row.position == 0 {
            println!("  chosen: {} ({})", row.candidate_name, row.candidate_nevra);
        } else {
            println!("  also: {} ({})", row.candidate_name, row.candidate_nevra);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContentsId, FileId, PackageId};

    fn row(file: i32, package: i32, name: &str, ei_class: i16, soname: Option<&str>) -> ElfFileRow {
        ElfFileRow {
            file: FileId(file),
            package: PackageId(package),
            name: name.to_owned(),
            contents: ContentsId(file),
            ei_class,
            ei_data: 1,
            soname: soname.map(|s| s.to_owned()),
        }
    }

    #[test]
    fn test_resolve_unique() {
        let needer = row(1, 1, "/usr/bin/app", 2, None);
        let lib64 = row(2, 2, "/usr/lib64/libA.so.1", 2, Some("libA.so.1"));
        let lib32 = row(3, 3, "/usr/lib/libA.so.1", 1, Some("libA.so.1"));
        let candidates = [&lib64, &lib32];
        match resolve(&needer, &candidates) {
            Resolution::Chosen(chosen) => assert_eq!(chosen.file, FileId(2)),
            _ => panic!("expected a unique resolution"),
        }
    }

    #[test]
    fn test_resolve_conflict_excludes_other_class() {
        let needer = row(1, 1, "/usr/bin/app", 2, None);
        let x = row(2, 2, "/x/libA.so.1", 2, Some("libA.so.1"));
        let y = row(3, 3, "/y/libA.so.1", 2, Some("libA.so.1"));
        let z = row(4, 4, "/z/libA.so.1", 1, Some("libA.so.1"));
        let candidates = [&x, &y, &z];
        match resolve(&needer, &candidates) {
            Resolution::Conflict(choices) => {
                let ids: Vec<_> = choices.iter().map(|c| c.file).collect();
                assert_eq!(ids, vec![FileId(2), FileId(3)]);
            }
            _ => panic!("expected a conflict"),
        }
    }

    #[test]
    fn test_resolve_missing_when_only_other_class() {
        let needer = row(1, 1, "/usr/bin/app", 2, None);
        let z = row(4, 4, "/z/libA.so.1", 1, Some("libA.so.1"));
        let candidates = [&z];
        assert!(matches!(resolve(&needer, &candidates), Resolution::Missing));
    }
}
