//! Remote document-store driver speaking the CouchDB HTTP dialect.
//!
//! Layout: one database per owner (`<prefix>-<sanitized owner>`), one
//! document per (category, key path) with `_id = "CATEGORY/joined_key"`.
//! Reads are GETs by id, writes are rev-checked PUTs, category scans use
//! `_all_docs` with a start/end key range, and bulk import goes through
//! `_bulk_docs`. `clear_all` without a category deletes the database.
//!
//! Database names are restricted by the server, so the owner name is
//! sanitized for the database name and the original spelling is kept in a
//! `_local/owner` marker document for discovery.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::driver::{ExportBlob, StorageDriver, validate_blob_depths};
use crate::error::{ConfigError, ConfigResult};
use crate::identifier::{Category, Identifier};
use crate::value::{get_path, remove_path, set_path};

/// End-of-range sentinel for `_all_docs` prefix scans.
const HIGH_KEY: char = '\u{fff0}';

/// CouchDB-compatible remote document store.
pub struct CouchDriver {
    client: reqwest::Client,
    base: Url,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    value: RowValue,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RowValue {
    rev: String,
}

impl CouchDriver {
    /// Create a driver against `base` (scheme, host, credentials). Database
    /// names are prefixed with `prefix`.
    pub fn new(base: Url, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        info!(server = %base.host_str().unwrap_or("?"), prefix = %prefix, "couch driver opened");
        Self {
            client: reqwest::Client::new(),
            base,
            prefix,
        }
    }

    /// Owners that have a database on the server, resolved through each
    /// database's `_local/owner` marker.
    pub async fn list_owners(&self) -> ConfigResult<Vec<String>> {
        let url = self.url(&["_all_dbs"])?;
        let resp = self.client.get(url).send().await?;
        let names: Vec<String> = self.checked(resp, "_all_dbs").await?.json().await?;

        let mut owners = Vec::new();
        let db_prefix = format!("{}-", self.prefix);
        for db in names {
            let Some(suffix) = db.strip_prefix(&db_prefix) else {
                continue;
            };
            let marker = self.url(&[&db, "_local", "owner"])?;
            let resp = self.client.get(marker).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                // Pre-marker database; fall back to the sanitized name.
                owners.push(suffix.to_string());
                continue;
            }
            let body: Value = self.checked(resp, "owner marker").await?.json().await?;
            match body.get("name").and_then(Value::as_str) {
                Some(name) => owners.push(name.to_string()),
                None => owners.push(suffix.to_string()),
            }
        }
        owners.sort();
        Ok(owners)
    }

    // -----------------------------------------------------------------------
    // Naming
    // -----------------------------------------------------------------------

    fn db_name(&self, owner: &str) -> String {
        format!("{}-{}", self.prefix, sanitize_db_component(owner))
    }

    fn doc_id(id: &Identifier) -> String {
        format!("{}/{}", id.category(), id.joined_key())
    }

    /// The `_id` range prefix covering every document of `category` under
    /// the (possibly empty) joined key-path prefix.
    fn scan_prefix(category: &Category, joined: &str) -> String {
        if joined.is_empty() {
            format!("{category}/")
        } else {
            format!("{category}/{joined}/")
        }
    }

    fn url(&self, segments: &[&str]) -> ConfigResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ConfigError::backend("couch base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // -----------------------------------------------------------------------
    // HTTP plumbing
    // -----------------------------------------------------------------------

    /// Map a non-success status to [`ConfigError::Backend`].
    async fn checked(
        &self,
        resp: reqwest::Response,
        context: &str,
    ) -> ConfigResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ConfigError::backend(format!(
            "{context}: HTTP {status}: {body}"
        )))
    }

    /// Create the owner's database if it does not exist yet, writing the
    /// owner marker on first creation.
    async fn ensure_db(&self, owner: &str) -> ConfigResult<String> {
        let db = self.db_name(owner);
        let resp = self.client.put(self.url(&[&db])?).send().await?;
        match resp.status() {
            reqwest::StatusCode::CREATED => {
                debug!(owner = %owner, db = %db, "database created");
                let marker = self.url(&[&db, "_local", "owner"])?;
                let resp = self
                    .client
                    .put(marker)
                    .json(&json!({"name": owner}))
                    .send()
                    .await?;
                self.checked(resp, "owner marker write").await?;
            }
            reqwest::StatusCode::PRECONDITION_FAILED => {}
            _ => {
                self.checked(resp, "database create").await?;
            }
        }
        Ok(db)
    }

    /// Fetch a document with its `_rev`, or `None` on 404 (missing
    /// document or missing database).
    async fn fetch_doc(&self, db: &str, doc_id: &str) -> ConfigResult<Option<Value>> {
        let resp = self.client.get(self.url(&[db, doc_id])?).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc = self.checked(resp, "document read").await?.json().await?;
        Ok(Some(doc))
    }

    /// List documents whose `_id` starts with `prefix`.
    async fn scan(
        &self,
        db: &str,
        prefix: &str,
        include_docs: bool,
    ) -> ConfigResult<Vec<AllDocsRow>> {
        let url = self.url(&[db, "_all_docs"])?;
        let startkey = serde_json::to_string(prefix)?;
        let endkey = serde_json::to_string(&format!("{prefix}{HIGH_KEY}"))?;
        let resp = self
            .client
            .get(url)
            .query(&[
                ("include_docs", include_docs.to_string()),
                ("startkey", startkey),
                ("endkey", endkey),
            ])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: AllDocsResponse = self.checked(resp, "_all_docs").await?.json().await?;
        Ok(body.rows)
    }

    /// Rev-checked single-document write.
    async fn put_doc(&self, db: &str, doc_id: &str, body: Value) -> ConfigResult<()> {
        let resp = self
            .client
            .put(self.url(&[db, doc_id])?)
            .json(&body)
            .send()
            .await?;
        self.checked(resp, "document write").await?;
        Ok(())
    }

    /// Apply a batch of writes through `_bulk_docs`, failing if any single
    /// document was rejected.
    async fn bulk_docs(&self, db: &str, docs: Vec<Value>) -> ConfigResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.url(&[db, "_bulk_docs"])?)
            .json(&json!({"docs": docs}))
            .send()
            .await?;
        let results: Vec<Value> = self.checked(resp, "_bulk_docs").await?.json().await?;
        for result in &results {
            if let Some(error) = result.get("error").and_then(Value::as_str) {
                let id = result.get("id").and_then(Value::as_str).unwrap_or("?");
                return Err(ConfigError::backend(format!(
                    "bulk write rejected `{id}`: {error}"
                )));
            }
        }
        Ok(())
    }

    /// Delete every document whose `_id` starts with `prefix`.
    async fn delete_prefix(&self, db: &str, prefix: &str) -> ConfigResult<()> {
        let rows = self.scan(db, prefix, false).await?;
        let tombstones = rows
            .into_iter()
            .map(|row| json!({"_id": row.id, "_rev": row.value.rev, "_deleted": true}))
            .collect();
        self.bulk_docs(db, tombstones).await
    }
}

/// Restrict an owner name to the character set the server allows in
/// database names: lowercased, with anything outside `[a-z0-9_-]`
/// replaced. Collisions are resolved through the `_local/owner` marker,
/// not the name itself.
fn sanitize_db_component(owner: &str) -> String {
    owner
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

/// Drop CouchDB bookkeeping fields (`_id`, `_rev`) from a fetched document.
fn strip_meta(doc: Value) -> Value {
    match doc {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .collect(),
        ),
        other => other,
    }
}

#[async_trait]
impl StorageDriver for CouchDriver {
    async fn get(&self, id: &Identifier) -> ConfigResult<Value> {
        let db = self.db_name(id.owner());
        let not_found = || ConfigError::NotFound {
            ident: id.to_string(),
        };

        if id.is_full_depth() {
            let doc = self
                .fetch_doc(&db, &Self::doc_id(id))
                .await?
                .ok_or_else(not_found)?;
            let body = strip_meta(doc);
            return get_path(&body, id.fields()).cloned().ok_or_else(not_found);
        }

        let prefix = Self::scan_prefix(id.category(), &id.joined_key());
        let rows = self.scan(&db, &prefix, true).await?;
        let mut matches = Map::new();
        for row in rows {
            let Some(doc) = row.doc else { continue };
            let Some(remaining) = row.id.strip_prefix(&prefix) else {
                continue;
            };
            matches.insert(remaining.to_string(), strip_meta(doc));
        }
        if matches.is_empty() {
            return Err(not_found());
        }
        Ok(Value::Object(matches))
    }

    async fn set(&self, id: &Identifier, value: Value) -> ConfigResult<()> {
        if !id.is_full_depth() {
            return Err(ConfigError::schema(format!(
                "cannot set at partial key path: {id}"
            )));
        }
        let db = self.ensure_db(id.owner()).await?;
        let doc_id = Self::doc_id(id);
        let existing = self.fetch_doc(&db, &doc_id).await?;
        let rev = existing
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut body = if id.fields().is_empty() {
            if !value.is_object() {
                return Err(ConfigError::schema(format!(
                    "top-level document at {id} must be a mapping"
                )));
            }
            value
        } else {
            let mut body = existing.map(strip_meta).unwrap_or_else(|| json!({}));
            set_path(&mut body, id.fields(), value)?;
            body
        };

        set_path(&mut body, &["_id"], Value::String(doc_id.clone()))?;
        if let Some(rev) = rev {
            set_path(&mut body, &["_rev"], Value::String(rev))?;
        }
        self.put_doc(&db, &doc_id, body).await?;
        debug!(id = %id, "document written");
        Ok(())
    }

    async fn clear(&self, id: &Identifier) -> ConfigResult<()> {
        let db = self.db_name(id.owner());

        if !id.is_full_depth() {
            let prefix = Self::scan_prefix(id.category(), &id.joined_key());
            return self.delete_prefix(&db, &prefix).await;
        }

        let doc_id = Self::doc_id(id);
        let Some(doc) = self.fetch_doc(&db, &doc_id).await? else {
            return Ok(());
        };

        if id.fields().is_empty() {
            let rev = doc
                .get("_rev")
                .and_then(Value::as_str)
                .ok_or_else(|| ConfigError::backend("document without _rev"))?;
            let resp = self
                .client
                .delete(self.url(&[&db, &doc_id])?)
                .query(&[("rev", rev)])
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(());
            }
            self.checked(resp, "document delete").await?;
            return Ok(());
        }

        let rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut body = strip_meta(doc);
        if !remove_path(&mut body, id.fields()) {
            return Ok(());
        }
        set_path(&mut body, &["_id"], Value::String(doc_id.clone()))?;
        if let Some(rev) = rev {
            set_path(&mut body, &["_rev"], Value::String(rev))?;
        }
        self.put_doc(&db, &doc_id, body).await
    }

    async fn clear_all(&self, owner: &str, category: Option<&Category>) -> ConfigResult<()> {
        let db = self.db_name(owner);
        match category {
            Some(category) => {
                let prefix = Self::scan_prefix(category, "");
                self.delete_prefix(&db, &prefix).await
            }
            None => {
                let resp = self.client.delete(self.url(&[&db])?).send().await?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                self.checked(resp, "database delete").await?;
                info!(owner = %owner, db = %db, "owner database dropped");
                Ok(())
            }
        }
    }

    async fn export_data(&self, owner: &str) -> ConfigResult<ExportBlob> {
        let db = self.db_name(owner);
        let rows = self.scan(&db, "", true).await?;

        let mut blob = ExportBlob::new();
        for row in rows {
            if row.id.starts_with('_') {
                continue;
            }
            let Some(doc) = row.doc else { continue };
            let Some((category, joined)) = row.id.split_once('/') else {
                warn!(doc_id = %row.id, "skipping document with unrecognized id shape");
                continue;
            };
            let entry = blob
                .entry(category.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(entry, &[joined], strip_meta(doc))?;
        }
        Ok(blob)
    }

    async fn import_data(
        &self,
        owner: &str,
        blob: ExportBlob,
        custom_groups: &HashMap<String, usize>,
    ) -> ConfigResult<()> {
        validate_blob_depths(&blob, custom_groups)?;
        let db = self.ensure_db(owner).await?;

        for (category, documents) in blob {
            let documents = documents
                .as_object()
                .cloned()
                .unwrap_or_default();

            // Replace semantics: drop the category's current documents,
            // then write the imported set in one batch.
            self.delete_prefix(&db, &format!("{category}/")).await?;
            let docs = documents
                .into_iter()
                .map(|(joined, doc)| {
                    let mut doc = doc;
                    set_path(
                        &mut doc,
                        &["_id"],
                        Value::String(format!("{category}/{joined}")),
                    )?;
                    Ok(doc)
                })
                .collect::<ConfigResult<Vec<_>>>()?;
            self.bulk_docs(&db, docs).await?;
            debug!(owner = %owner, category = %category, "category imported");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn db_names_are_sanitized_and_prefixed() {
        let driver = CouchDriver::new(Url::parse("http://localhost:5984").unwrap(), "herald");
        assert_eq!(driver.db_name("Bank"), "herald-bank");
        assert_eq!(driver.db_name("My Cog!"), "herald-my-cog-");
    }

    #[test]
    fn doc_ids_encode_the_category_and_key_path() {
        let id = Identifier::new(
            "Bank",
            Category::Member,
            vec!["g1".into(), "u/1".into()],
            2,
        )
        .unwrap();
        assert_eq!(CouchDriver::doc_id(&id), "MEMBER/g1/u%2F1");

        let global = Identifier::new("Bank", Category::Global, vec![], 0).unwrap();
        assert_eq!(CouchDriver::doc_id(&global), "GLOBAL/");
    }

    #[test]
    fn scan_prefixes_end_with_a_separator() {
        assert_eq!(CouchDriver::scan_prefix(&Category::Member, ""), "MEMBER/");
        assert_eq!(
            CouchDriver::scan_prefix(&Category::Member, "g1"),
            "MEMBER/g1/"
        );
    }

    #[test]
    fn strip_meta_drops_bookkeeping_fields() {
        let doc = json!({"_id": "GLOBAL/", "_rev": "1-abc", "balance": 5});
        assert_eq!(strip_meta(doc), json!({"balance": 5}));
    }

    #[test]
    fn urls_escape_path_segments() {
        let driver = CouchDriver::new(Url::parse("http://localhost:5984").unwrap(), "herald");
        let url = driver.url(&["herald-bank", "MEMBER/g1/u1"]).unwrap();
        assert_eq!(url.path(), "/herald-bank/MEMBER%2Fg1%2Fu1");
    }
}
