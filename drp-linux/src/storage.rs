//! Usage record on disk. Inbound records stream into `<file>.part` and replace the record
//! only on commit, so a cut transfer never clobbers good data.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use drp_core::chunk::ByteSink;
use drp_core::stats::StatsStore;

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Writes to a side file and renames it over the target on commit.
pub struct FileSink {
    target: PathBuf,
    part: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(target: PathBuf) -> Self {
        Self {
            part: part_path(&target),
            target,
            file: None,
        }
    }
}

impl ByteSink for FileSink {
    fn begin(&mut self) -> io::Result<()> {
        if let Some(dir) = self.part.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.file = Some(File::create(&self.part)?);
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::Other, "no transfer in progress")),
        }
    }

    fn commit(&mut self) -> io::Result<()> {
        let Some(mut f) = self.file.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no transfer in progress"));
        };
        f.flush()?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(&self.part, &self.target)
    }

    fn discard(&mut self) {
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.part) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.part.display(),
                    error = %e,
                    "could not remove partial record"
                );
            }
        }
    }
}

pub struct FileStatsStore {
    path: PathBuf,
    sink: FileSink,
}

impl FileStatsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            sink: FileSink::new(path.clone()),
            path,
        }
    }
}

impl StatsStore for FileStatsStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&mut self, blob: &[u8]) -> io::Result<()> {
        self.sink.begin()?;
        self.sink.append(blob)?;
        self.sink.commit()
    }

    fn sink(&mut self) -> &mut dyn ByteSink {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("drp-store-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&d);
        d.join("usage.json")
    }

    #[test]
    fn commit_replaces_record() {
        let path = scratch("commit");
        let mut store = FileStatsStore::new(path.clone());
        assert_eq!(store.load().unwrap(), None);
        store.save(b"{\"games\":[]}").unwrap();

        let sink = store.sink();
        sink.begin().unwrap();
        sink.append(b"{\"games\":").unwrap();
        sink.append(b"[],\"last_updated\":5}").unwrap();
        sink.commit().unwrap();

        assert_eq!(
            store.load().unwrap().unwrap(),
            b"{\"games\":[],\"last_updated\":5}".to_vec()
        );
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn discard_keeps_old_record() {
        let path = scratch("discard");
        let mut store = FileStatsStore::new(path.clone());
        store.save(b"{}").unwrap();
        let sink = store.sink();
        sink.begin().unwrap();
        sink.append(b"{\"gam").unwrap();
        sink.discard();
        assert_eq!(store.load().unwrap().unwrap(), b"{}".to_vec());
        assert!(!part_path(&path).exists());
        assert!(store.sink().append(b"x").is_err());
    }
}
