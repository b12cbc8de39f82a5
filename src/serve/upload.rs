//! Token-gated file uploads.
//!
//! Tokens are minted while rendering pages with file inputs and injected as
//! a meta tag; the upload endpoint rejects requests without one (403) or
//! over the configured body ceiling (413). Stored records are consumed at
//! form-validation time.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use indexmap::IndexMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::runtime::dispatch::UploadResolver;
use crate::runtime::Value;

#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct UploadStore {
    tokens: Mutex<HashSet<String>>,
    records: Mutex<HashMap<String, UploadedFile>>,
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl UploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a one-page upload token, injected as
    /// `<meta name="pywire-upload-token">`.
    pub fn mint_token(&self) -> String {
        let token = random_id(32);
        self.tokens.lock().unwrap().insert(token.clone());
        token
    }

    pub fn token_valid(&self, token: &str) -> bool {
        self.tokens.lock().unwrap().contains(token)
    }

    /// Store an uploaded file; returns its upload id.
    pub fn save(&self, filename: &str, content_type: &str, data: Vec<u8>) -> String {
        let id = random_id(24);
        self.records.lock().unwrap().insert(
            id.clone(),
            UploadedFile {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                data,
            },
        );
        id
    }
}

impl UploadResolver for UploadStore {
    /// Consume an upload id into the dict record the validator sees.
    fn take(&self, id: &str) -> Option<Value> {
        let file = self.records.lock().unwrap().remove(id)?;

        let mut record = IndexMap::new();
        record.insert("upload_id".to_string(), Value::Str(id.to_string()));
        record.insert("filename".to_string(), Value::Str(file.filename));
        record.insert(
            "content_type".to_string(),
            Value::Str(file.content_type),
        );
        record.insert("size".to_string(), Value::Int(file.data.len() as i64));
        Some(Value::Dict(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_validate() {
        let store = UploadStore::new();
        let token = store.mint_token();
        assert!(store.token_valid(&token));
        assert!(!store.token_valid("bogus"));
    }

    #[test]
    fn records_are_consumed_once() {
        let store = UploadStore::new();
        let id = store.save("a.png", "image/png", vec![0u8; 128]);

        let record = store.take(&id).unwrap();
        let Value::Dict(record) = record else { panic!() };
        assert_eq!(record["filename"], Value::Str("a.png".into()));
        assert_eq!(record["size"], Value::Int(128));

        assert!(store.take(&id).is_none());
    }
}
