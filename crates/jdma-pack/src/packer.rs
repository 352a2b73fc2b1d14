//! Splitting a batch into parts and writing them as tar archives.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use jdma_types::{ArchivePart, BatchId, Digest, FileEntry};
use sha2::{Digest as _, Sha256};
use tar::{Builder, Header};
use tracing::{debug, info};

use crate::error::PackError;
use crate::{part_file_name, verify_part};

/// The files assigned to one part before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub index: u32,
    /// Relative paths, in batch order.
    pub files: Vec<String>,
    /// Sum of the member file sizes.
    pub payload: u64,
}

/// A part written to the staging area.
#[derive(Debug, Clone)]
pub struct PackedPart {
    /// Row to persist; `handle` is still unset.
    pub part: ArchivePart,
    /// Location of the tar file in staging.
    pub path: PathBuf,
}

/// Splits a batch into parts no larger than `part_ceiling` payload bytes.
pub struct Packer {
    part_ceiling: u64,
}

impl Packer {
    pub fn new(part_ceiling: u64) -> Self {
        Self {
            part_ceiling: part_ceiling.max(1),
        }
    }

    pub fn part_ceiling(&self) -> u64 {
        self.part_ceiling
    }

    /// Assign files to parts in batch order.
    ///
    /// A part is closed when the next file would push its payload over the
    /// ceiling. A file larger than the ceiling gets a part of its own. An
    /// empty batch yields no parts.
    pub fn plan(&self, files: &[FileEntry]) -> Vec<PartPlan> {
        let mut plans: Vec<PartPlan> = Vec::new();
        let mut current = PartPlan {
            index: 0,
            files: Vec::new(),
            payload: 0,
        };

        for file in files {
            if !current.files.is_empty() && current.payload + file.size > self.part_ceiling {
                let next_index = current.index + 1;
                plans.push(std::mem::replace(
                    &mut current,
                    PartPlan {
                        index: next_index,
                        files: Vec::new(),
                        payload: 0,
                    },
                ));
            }
            current.files.push(file.path.clone());
            current.payload += file.size;
        }

        if !current.files.is_empty() {
            plans.push(current);
        }
        plans
    }

    /// Pack the batch rooted at `root` into tar parts under `out_dir`.
    ///
    /// Returns the written parts and the SHA-256 of every member file. Any
    /// part file already present in `out_dir` from an earlier attempt is
    /// overwritten.
    pub async fn pack(
        &self,
        batch_id: BatchId,
        root: &Path,
        files: &[FileEntry],
        out_dir: &Path,
    ) -> Result<(Vec<PackedPart>, BTreeMap<String, Digest>), PackError> {
        let plans = self.plan(files);
        let root = root.to_path_buf();
        let out_dir = out_dir.to_path_buf();

        let (parts, digests) =
            tokio::task::spawn_blocking(move || pack_blocking(batch_id, &root, &plans, &out_dir))
                .await??;

        info!(
            %batch_id,
            parts = parts.len(),
            files = digests.len(),
            "packed batch"
        );
        Ok((parts, digests))
    }
}

fn pack_blocking(
    batch_id: BatchId,
    root: &Path,
    plans: &[PartPlan],
    out_dir: &Path,
) -> Result<(Vec<PackedPart>, BTreeMap<String, Digest>), PackError> {
    std::fs::create_dir_all(out_dir)?;
    let mut parts = Vec::with_capacity(plans.len());
    let mut digests = BTreeMap::new();

    for plan in plans {
        let path = out_dir.join(part_file_name(plan.index));
        let mut builder = Builder::new(BufWriter::new(File::create(&path)?));

        for rel in &plan.files {
            let source = root.join(rel);
            let file = match File::open(&source) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(PackError::SourceMissing { path: rel.clone() });
                }
                Err(e) => return Err(PackError::Io(e)),
            };
            let meta = file.metadata()?;

            let mut header = Header::new_gnu();
            header.set_size(meta.len());
            header.set_mode(0o644);
            header.set_mtime(
                meta.modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs()),
            );
            header.set_cksum();

            let mut reader = HashingReader::new(file.take(meta.len()));
            builder.append_data(&mut header, rel, &mut reader)?;
            digests.insert(rel.clone(), reader.finish());
        }

        let writer = builder.into_inner()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        let size = std::fs::metadata(&path)?.len();
        let checksum = Digest::of_file(&path)?;
        // Re-read once so a short write is caught before upload.
        verify_part(&path, plan.index, checksum)?;
        debug!(%batch_id, index = plan.index, size, %checksum, "wrote part");

        parts.push(PackedPart {
            part: ArchivePart {
                batch_id,
                index: plan.index,
                size,
                checksum,
                files: plan.files.clone(),
                handle: None,
            },
            path,
        });
    }

    Ok((parts, digests))
}

/// Hashes the bytes as they are streamed into the archive.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> Digest {
        Digest::from(<[u8; 32]>::from(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            digest: None,
        }
    }

    #[test]
    fn test_plan_respects_ceiling() {
        let packer = Packer::new(100);
        let files = vec![
            entry("a", 40),
            entry("b", 40),
            entry("c", 40),
            entry("d", 100),
            entry("e", 10),
        ];
        let plans = packer.plan(&files);
        let grouped: Vec<Vec<&str>> = plans
            .iter()
            .map(|p| p.files.iter().map(String::as_str).collect())
            .collect();
        assert_eq!(grouped, vec![vec!["a", "b"], vec!["c"], vec!["d"], vec!["e"]]);
        assert!(plans.iter().all(|p| p.payload <= 100));
        let indices: Vec<u32> = plans.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_oversized_file_gets_own_part() {
        let packer = Packer::new(10);
        let plans = packer.plan(&[entry("small", 5), entry("huge", 1000), entry("tail", 5)]);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[1].files, vec!["huge".to_string()]);
        assert_eq!(plans[1].payload, 1000);
    }

    #[test]
    fn test_empty_batch_has_no_parts() {
        assert!(Packer::new(10).plan(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_pack_records_checksums_and_digests() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        std::fs::create_dir_all(root.join("run1")).unwrap();
        std::fs::write(root.join("run1/a.nc"), b"alpha").unwrap();
        std::fs::write(root.join("b.txt"), b"bravo!").unwrap();

        let files = vec![entry("run1/a.nc", 5), entry("b.txt", 6)];
        let (parts, digests) = Packer::new(5)
            .pack(BatchId::new(1), &root, &files, &dir.path().join("stage"))
            .await
            .unwrap();

        assert_eq!(parts.len(), 2);
        for packed in &parts {
            assert!(packed.path.exists());
            assert_eq!(Digest::of_file(&packed.path).unwrap(), packed.part.checksum);
            assert_eq!(packed.part.size, std::fs::metadata(&packed.path).unwrap().len());
            assert!(packed.part.handle.is_none());
        }
        assert_eq!(digests["run1/a.nc"], Digest::of(b"alpha"));
        assert_eq!(digests["b.txt"], Digest::of(b"bravo!"));
    }

    #[tokio::test]
    async fn test_pack_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = Packer::new(1024)
            .pack(
                BatchId::new(1),
                dir.path(),
                &[entry("gone.dat", 3)],
                &dir.path().join("stage"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::SourceMissing { path } if path == "gone.dat"));
    }
}
