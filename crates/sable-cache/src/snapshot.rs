//! On-disk cache snapshots.
//!
//! One record per line, tab-separated (see [`Mapping::to_record`]); `#`
//! comments and blank lines are ignored. Saves are deterministic (sorted
//! by request type, then key) and atomic (temp-file rename). Loads are
//! tolerant: malformed records are logged and skipped, a missing file is
//! not an error.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use tracing::{debug, warn};

use crate::mapping::Mapping;
use crate::store::CacheStore;

impl CacheStore {
    /// Writes a snapshot of every reverse mapping plus the current forward
    /// mapping of each host entry.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut records = self.snapshot_records();
        records.sort_by(|a, b| (a.rtype(), a.key()).cmp(&(b.rtype(), b.key())));

        let tmp = path.with_extension("tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        writeln!(out, "# sable dns cache, saved {}", Utc::now().to_rfc3339())?;
        for mapping in records {
            writeln!(out, "{}", mapping.to_record())?;
        }
        out.into_inner().map_err(io::Error::from)?.sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(path = %path.display(), "cache snapshot written");
        Ok(())
    }

    /// Loads a snapshot, overwriting cached entries on duplicate keys.
    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache snapshot to load");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut loaded = 0usize;
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match Mapping::from_record(line) {
                Ok(mapping) => {
                    self.install_loaded(mapping);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed cache record");
                }
            }
        }

        debug!(path = %path.display(), records = loaded, "cache snapshot loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use sable_resolver::RequestType;

    use super::*;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn populated_store() -> CacheStore {
        let mut store = CacheStore::new(60);
        store.ingest_host("b.test", RequestType::A, Some(ips(&["192.0.2.2"])), 300, false, 1_000);
        store.ingest_host("a.test", RequestType::A, Some(ips(&["192.0.2.1", "2001:db8::1"])), 300, false, 1_000);
        store.ingest_host("gone.test", RequestType::A, None, 0, false, 1_000);
        store.ingest_addr("192.0.2.7".parse().unwrap(), Some("host.example".into()), 600, 1_000);
        store.ingest_addr("192.0.2.3".parse().unwrap(), None, 0, 1_000);
        store
    }

    #[test]
    fn save_is_sorted_and_reload_compares_equal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_cache");

        let store = populated_store();
        store.save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let keys: Vec<&str> = content
            .lines()
            .filter(|l| !l.starts_with('#') && !l.is_empty())
            .map(|l| l.split('\t').nth(4).unwrap())
            .collect();
        assert_eq!(keys, vec!["a.test", "b.test", "gone.test", "192.0.2.3", "192.0.2.7"]);

        let mut reloaded = CacheStore::new(60);
        reloaded.load(&path).unwrap();

        for name in ["a.test", "b.test", "gone.test"] {
            assert_eq!(reloaded.host_mapping(name), store.host_mapping(name));
        }
        for addr in ["192.0.2.7", "192.0.2.3"] {
            let addr: IpAddr = addr.parse().unwrap();
            assert_eq!(reloaded.addr_mapping(&addr), store.addr_mapping(&addr));
        }

        // save(load(x)) reproduces x byte-for-byte below the header
        let second = dir.path().join("dns_cache2");
        reloaded.save(&second).unwrap();
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.starts_with('#'))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(
            strip(&fs::read_to_string(&second).unwrap()),
            strip(&content)
        );
    }

    #[test]
    fn load_skips_malformed_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_cache");
        fs::write(
            &path,
            "# header\n\n1000\t300\tA\t0\ta.test\t192.0.2.1\nbogus line\n1000\t300\tPTR\t0\tnot-an-ip\thost.example\n",
        )
        .unwrap();

        let mut store = CacheStore::new(60);
        store.load(&path).unwrap();
        assert_eq!(store.host_count(), 1);
        assert_eq!(store.addr_count(), 0);
    }

    #[test]
    fn load_missing_file_is_fine() {
        let mut store = CacheStore::new(60);
        store
            .load(Path::new("/nonexistent/sable/dns_cache"))
            .unwrap();
        assert_eq!(store.host_count(), 0);
    }

    #[test]
    fn duplicate_keys_overwrite_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_cache");
        fs::write(
            &path,
            "1000\t300\tA\t0\ta.test\t192.0.2.1\n2000\t600\tA\t0\ta.test\t192.0.2.9\n",
        )
        .unwrap();

        let mut store = CacheStore::new(60);
        store.load(&path).unwrap();
        let mapping = store.host_mapping("a.test").unwrap();
        assert_eq!(mapping.addrs(), &ips(&["192.0.2.9"])[..]);
        assert_eq!(mapping.created(), 2_000);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_cache");
        populated_store().save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
