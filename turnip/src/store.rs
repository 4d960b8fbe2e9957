//! On-disk repository store.
//!
//! Repositories are bare and live under a single root; the store wraps
//! `git2` for initialisation and configuration, and materialises the push
//! hooks that call back into the hook RPC socket. A repository created as a
//! clone holds the source's pack files by hardlink in a subordinate
//! directory wired up through `objects/info/alternates`; it never owns them.
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Alternates directory of a cloned repository.
pub const SUBORDINATE: &str = "turnip-subordinate";

/// The hook executable every repository gets; `pre-receive`, `post-receive`
/// and `update` are symlinks to it.
pub const HOOK_PAYLOAD: &[u8] = include_bytes!("store/hook.py");

const HOOK_LINKS: &[&str] = &["pre-receive", "post-receive", "update"];

const CONFIG_KEYS: &[(&str, bool)] = &[
    ("core.logallrefupdates", true),
    ("repack.writeBitmaps", true),
    ("receive.autogc", false),
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository already exists")]
    AlreadyExists,
    #[error("Path not contained within root")]
    PathEscapes,
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolve a wire pathname to an on-disk path, stripping leading slashes
/// and refusing anything that would escape the root.
pub fn compose_path(root: &Path, pathname: &[u8]) -> Result<PathBuf, Error> {
    let pathname = std::str::from_utf8(pathname).map_err(|_| Error::PathEscapes)?;
    let relative = Path::new(pathname.trim_start_matches('/'));
    let mut composed = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => composed.push(part),
            Component::CurDir => {}
            _ => return Err(Error::PathEscapes),
        }
    }
    Ok(composed)
}

/// Create a bare repository, optionally hardlinking `clone_from`'s packs
/// into a subordinate alternates directory.
pub fn init(path: &Path, clone_from: Option<&Path>, clone_refs: bool) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // O_EXCL-style gate: a concurrent init of the same path loses here.
    fs::create_dir(path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            Error::AlreadyExists
        } else {
            Error::Io(e)
        }
    })?;
    let mut opts = git2::RepositoryInitOptions::new();
    opts.bare(true).no_reinit(true);
    let repo = git2::Repository::init_opts(path, &opts)?;

    if let Some(source) = clone_from {
        let subordinate = path.join(SUBORDINATE);
        let pack_dir = subordinate.join("objects").join("pack");
        fs::create_dir_all(&pack_dir)?;
        let source_packs = source.join("objects").join("pack");
        if source_packs.is_dir() {
            for entry in fs::read_dir(&source_packs)? {
                let entry = entry?;
                fs::hard_link(entry.path(), pack_dir.join(entry.file_name()))?;
            }
        }
        fs::write(
            path.join("objects").join("info").join("alternates"),
            format!("{}\n", subordinate.join("objects").display()),
        )?;
        if clone_refs {
            let source_repo = git2::Repository::open_bare(source)?;
            for reference in source_repo.references()? {
                let reference = reference?;
                if let (Some(name), Some(target)) = (reference.name(), reference.target())
                {
                    repo.reference(name, target, true, "cloned from source")?;
                }
            }
        }
    }
    ensure_config(path)
}

/// Remove a repository. Not finding one is fine.
pub fn delete(path: &Path) -> Result<(), Error> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Enforce the repository configuration the backend relies on. A config
/// that is already correct is left untouched, mtime included.
pub fn ensure_config(path: &Path) -> Result<(), Error> {
    let mut config = git2::Config::open(&path.join("config"))?;
    for (key, wanted) in CONFIG_KEYS {
        if config.get_bool(key).ok() != Some(*wanted) {
            config.set_bool(key, *wanted)?;
        }
    }
    Ok(())
}

/// Materialise the hook executable and its symlinks, and evict anything
/// else living in `hooks/`.
pub fn ensure_hooks(path: &Path) -> Result<(), Error> {
    let hooks = path.join("hooks");
    fs::create_dir_all(&hooks)?;

    let hook = hooks.join("hook.py");
    if fs::read(&hook).ok().as_deref() != Some(HOOK_PAYLOAD) {
        fs::write(&hook, HOOK_PAYLOAD)?;
    }
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))?;

    for name in HOOK_LINKS {
        let link = hooks.join(name);
        match fs::read_link(&link) {
            Ok(target) if target == Path::new("hook.py") => continue,
            Ok(_) => fs::remove_file(&link)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            // Present but not a symlink.
            Err(_) => remove_entry(&link)?,
        }
        symlink("hook.py", &link)?;
    }

    for entry in fs::read_dir(&hooks)? {
        let entry = entry?;
        let name = entry.file_name();
        if name != "hook.py" && !HOOK_LINKS.iter().any(|link| name == *link) {
            remove_entry(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(_) => fs::remove_dir_all(path),
    }
}
