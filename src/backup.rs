use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/teacherhub.sqlite3";
pub const BUNDLE_FORMAT: &str = "teacherhub-workspace-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    app_version: String,
    exported_at: String,
    db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub exported_at: String,
    pub db_bytes: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn export_workspace_bundle(workspace: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace.join(DB_FILE_NAME);
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read workspace database {}", db_path.display()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = Manifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_sha256: db_sha256.clone(),
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize bundle")?;

    tracing::info!(out = %out_path.display(), sha256 = %db_sha256, "workspace exported");
    Ok(ExportSummary {
        db_sha256,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Restores the database from a bundle. The caller must drop any open
/// connection to the workspace before calling this and reopen afterwards.
pub fn import_workspace_bundle(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("bundle is not a zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != manifest.db_sha256 {
        return Err(anyhow!(
            "database checksum mismatch: manifest {} vs bundle {}",
            manifest.db_sha256,
            actual
        ));
    }

    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let dst = workspace.join(DB_FILE_NAME);
    let tmp = workspace.join(format!("{}.importing", DB_FILE_NAME));
    {
        let mut out = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        out.write_all(&db_bytes)
            .context("failed to write extracted database")?;
        out.flush().context("failed to flush extracted database")?;
    }
    // rename replaces an existing database in one step.
    std::fs::rename(&tmp, &dst)
        .with_context(|| format!("failed to move extracted database to {}", dst.display()))?;

    tracing::info!(bundle = %in_path.display(), exported_at = %manifest.exported_at, "workspace restored");
    Ok(ImportSummary {
        exported_at: manifest.exported_at,
        db_bytes: db_bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn class_names(workspace: &Path) -> Vec<String> {
        let conn = open_db(workspace).expect("open");
        let mut stmt = conn
            .prepare("SELECT name FROM classes ORDER BY name")
            .expect("prepare");
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        names
    }

    #[test]
    fn import_replaces_existing_database_in_place() {
        let ws = temp_workspace("teacherhub-backup-replace");
        let bundle = ws.join("out").join("bundle.zip");
        {
            let conn = open_db(&ws).expect("open");
            conn.execute("INSERT INTO classes(id, name) VALUES('c1', 'Before')", [])
                .expect("insert");
        }
        let exported = export_workspace_bundle(&ws, &bundle).expect("export");
        {
            let conn = open_db(&ws).expect("reopen");
            conn.execute("INSERT INTO classes(id, name) VALUES('c2', 'After')", [])
                .expect("insert");
        }
        assert_eq!(class_names(&ws), vec!["After", "Before"]);

        let imported = import_workspace_bundle(&bundle, &ws).expect("import");
        assert_eq!(imported.db_bytes, exported.db_bytes);
        assert_eq!(class_names(&ws), vec!["Before"]);
        assert!(!ws.join(format!("{}.importing", DB_FILE_NAME)).exists());
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
