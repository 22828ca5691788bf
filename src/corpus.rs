use crate::paths::AppPaths;
use crate::{Result, UpsizerError};
use sha2::{Digest, Sha512};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Digest function used to fingerprint image content.
pub type ContentHasher = fn(&[u8]) -> String;

/// SHA-512 of placeholder graphics the search backend serves in place of a
/// real result. They decode fine, so only content identity gives them away.
const BUILTIN_PLACEHOLDER_HASHES: &[&str] = &[
    "e663f9122d24f60aade166046334e60b1e195ad95a8946227e8c03cfd14031684a2f7acdcfa7322f96650259f79791c661e9b7e006735958f019c081c43bc128",
    "306961ff9f3c040d28bea9dfde979561efc3296999b17648fede6c7dcf9f92f0c1c79d300eb5a65a861590d6329382cf45d1666574aba2b63047fa8db14f99c8",
    "36d80b0d60370fcf101a95b6e4984558eed5cf84df4e0eba75a7546022556ab65ea7cf6fcceb0cdf27f0d074654e34ec693fd363b8e91eab589f0dc36961bcf4",
    "67cc3285a9599313c9de8773d1d51beaafab83a417cb383e20516308c6518122b8aa6483802d9445833c982fb5b1959a4442be95676bb8ce41660c4e6aac7820",
    "8bd63f441973551d6d5716f28cc47c7e721d1b7db26fe5c2ecabd4edef32b1ea215ff102fabd8f22dac2edadddf95c759295ebe46ec4116567ebb621c114ecaf",
    "9a676acc978810ea5146dda64695d06a1b83bf7c43b7a7b923c05771235dfce0b36027f6588a80dbcc9009f115c5d21799104344ce6546792b498ab4566dd315",
    "235f79c78d054d3de1182dab7cab9658ef61901558a4a99e7f41f869338a026fbc116d17f521f792e42d0887f4e42fe976922e40e05d841397ba393f830f7fd0",
    "dc987a5cee8e3cefbae339ca82cd006fefbfa9d89b82c83adb5413e1ffc91eb62c8a4fb258e7f9dbc0d4338c033aa9b205e00c0563e418e0a0d74e7ae8be6817",
];

const SHA512_HEX_LEN: usize = 128;

pub fn sha512_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Known placeholder fingerprints. Built once, read-only afterwards; clones
/// share the same set.
#[derive(Clone)]
pub struct ErrorImageCorpus {
    hashes: Arc<HashSet<String>>,
    hasher: ContentHasher,
}

impl std::fmt::Debug for ErrorImageCorpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorImageCorpus")
            .field("hashes", &self.hashes.len())
            .finish()
    }
}

impl ErrorImageCorpus {
    pub fn new<I, S>(hashes: I, hasher: ContentHasher) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hashes = hashes
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            hashes: Arc::new(hashes),
            hasher,
        }
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_PLACEHOLDER_HASHES.iter().copied(), sha512_hex)
    }

    /// Built-in seeds plus any digests listed in the config dir.
    pub fn load(paths: &AppPaths) -> Result<Self> {
        let mut hashes: Vec<String> = BUILTIN_PLACEHOLDER_HASHES
            .iter()
            .map(|h| h.to_string())
            .collect();
        let extra_path = paths.placeholder_hashes_path();
        if extra_path.exists() {
            hashes.extend(read_hash_list(&extra_path)?);
        }
        Ok(Self::new(hashes, sha512_hex))
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> String {
        (self.hasher)(bytes)
    }

    pub fn is_placeholder(&self, bytes: &[u8]) -> bool {
        self.hashes.contains(&self.fingerprint(bytes))
    }

    pub fn is_placeholder_file(&self, path: &Path) -> Result<bool> {
        let bytes = std::fs::read(path)?;
        Ok(self.is_placeholder(&bytes))
    }
}

fn read_hash_list(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() != SHA512_HEX_LEN || hex::decode(trimmed).is_err() {
            return Err(UpsizerError::Config(format!(
                "{}:{}: expected a {SHA512_HEX_LEN}-char hex sha512 digest",
                path.to_string_lossy(),
                idx + 1
            )));
        }
        out.push(trimmed.to_ascii_lowercase());
    }
    Ok(out)
}
