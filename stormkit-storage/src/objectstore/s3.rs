//! S3-compatible backend.
//!
//! Talks to any S3-compatible endpoint with SigV4-signed requests over
//! `reqwest`. Client files are stored individually under
//! `<appID>/<deploymentID>/` so `get_file` can address them; server and api
//! payloads are stored as whole zips at `<appID>/<deploymentID>/<zip-name>`.
//! Every PUT carries `x-amz-server-side-encryption: AES256`.

use super::{
    DeleteArtifactsArgs, FileContent, GetFileArgs, StoreError, UploadArgs, UploadOverview,
    UploadResult, content_type_for, split_location,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use time::OffsetDateTime;
use time::macros::format_description;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint base, e.g. `https://s3.eu-central-1.amazonaws.com` or a
    /// MinIO address. Buckets are addressed path-style.
    pub endpoint: String,
    pub region: String,
    /// Bucket receiving new uploads. Reads use the bucket carried in the
    /// location URI instead.
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Clone)]
pub struct S3Store {
    config: S3Config,
    client: reqwest::Client,
}

impl S3Store {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn upload(&self, args: UploadArgs) -> Result<UploadResult, StoreError> {
        let prefix = format!("{}/{}", args.app_id, args.deployment_id);
        let mut result = UploadResult::default();

        if let Some(zip_path) = &args.client_zip {
            result.client = self.upload_client_files(zip_path, &prefix).await?;
        }
        if let Some(zip_path) = &args.server_zip {
            result.server = self
                .upload_whole_zip(zip_path, &prefix, "sk-server.zip", &args.server_handler)
                .await?;
        }
        if let Some(zip_path) = &args.api_zip {
            result.api = self
                .upload_whole_zip(zip_path, &prefix, "sk-api.zip", &args.api_handler)
                .await?;
        }

        Ok(result)
    }

    /// Extract the client zip and put every entry as its own object so the
    /// edge can fetch files individually.
    async fn upload_client_files(
        &self,
        zip_path: &Path,
        prefix: &str,
    ) -> Result<Option<UploadOverview>, StoreError> {
        let file = match fs::File::open(zip_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bucket = self.config.bucket.clone();
        let mut archive = zip::ZipArchive::new(file)?;
        let mut bytes_uploaded = 0u64;
        let mut files_uploaded = 0u64;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let Some(name) = entry.enclosed_name() else {
                continue;
            };
            let name = name.to_string_lossy().to_string();

            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content)?;

            let key = format!("{prefix}/{name}");
            bytes_uploaded += content.len() as u64;
            self.put_object(&bucket, &key, content, content_type_for(&name))
                .await?;
            files_uploaded += 1;
        }

        Ok(Some(UploadOverview {
            bytes_uploaded,
            files_uploaded,
            location: format!("s3:{bucket}/{prefix}"),
        }))
    }

    async fn upload_whole_zip(
        &self,
        zip_path: &Path,
        prefix: &str,
        zip_name: &str,
        handler: &str,
    ) -> Result<Option<UploadOverview>, StoreError> {
        let content = match fs::read(zip_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bucket = self.config.bucket.clone();
        let key = format!("{prefix}/{zip_name}");
        let bytes_uploaded = content.len() as u64;

        self.put_object(&bucket, &key, content, "application/zip")
            .await?;

        let mut location = format!("s3:{bucket}/{key}");
        if !handler.is_empty() {
            location = format!("{location}:{handler}");
        }

        Ok(Some(UploadOverview {
            bytes_uploaded,
            files_uploaded: 1,
            location,
        }))
    }

    pub async fn get_file(&self, args: GetFileArgs) -> Result<Option<FileContent>, StoreError> {
        let (_, rest) = split_location(&args.location)?;
        let (bucket, prefix) = rest
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidLocation(args.location.clone()))?;

        let key = format!("{}/{}", prefix, args.file_name.trim_start_matches('/'));
        let Some(content) = self.get_object(bucket, &key).await? else {
            return Ok(None);
        };

        Ok(Some(FileContent {
            content_type: content_type_for(&key).to_string(),
            size: content.len() as u64,
            content,
        }))
    }

    pub async fn delete_artifacts(&self, args: DeleteArtifactsArgs) -> Result<(), StoreError> {
        let location = [
            args.storage_location,
            args.function_location,
            args.api_location,
        ]
        .into_iter()
        .find(|l| !l.is_empty());

        let Some(location) = location else {
            return Ok(());
        };

        let (_, rest) = split_location(&location)?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidLocation(location.clone()))?;

        // Everything under <appID>/<deploymentID>/ belongs to the deployment.
        let prefix: String = key.split('/').take(2).collect::<Vec<_>>().join("/");

        for object in self.list_prefix(bucket, &prefix).await? {
            self.delete_object(bucket, &object).await?;
        }

        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let path = format!("/{bucket}/{}", uri_encode(key, false));
        let payload_hash = hex_sha256(&body);
        let mut headers = self.base_headers(&payload_hash);
        headers.insert(
            "x-amz-server-side-encryption".to_string(),
            "AES256".to_string(),
        );

        let authorization = self.authorization("PUT", &path, "", &headers, &payload_hash);
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self
            .client
            .put(&url)
            .header("authorization", authorization)
            .header("content-type", content_type);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::UpstreamStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = format!("/{bucket}/{}", uri_encode(key, false));
        let payload_hash = hex_sha256(b"");
        let headers = self.base_headers(&payload_hash);
        let authorization = self.authorization("GET", &path, "", &headers, &payload_hash);
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self.client.get(&url).header("authorization", authorization);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            404 => Ok(None),
            status if response.status().is_success() => {
                let _ = status;
                Ok(Some(response.bytes().await?.to_vec()))
            }
            status => Err(StoreError::UpstreamStatus(status)),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = format!("/{bucket}/{}", uri_encode(key, false));
        let payload_hash = hex_sha256(b"");
        let headers = self.base_headers(&payload_hash);
        let authorization = self.authorization("DELETE", &path, "", &headers, &payload_hash);
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self
            .client
            .delete(&url)
            .header("authorization", authorization);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(StoreError::UpstreamStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = format!("/{bucket}");
        let query = format!("list-type=2&prefix={}", uri_encode(prefix, true));
        let payload_hash = hex_sha256(b"");
        let headers = self.base_headers(&payload_hash);
        let authorization = self.authorization("GET", &path, &query, &headers, &payload_hash);
        let url = format!("{}{}?{}", self.config.endpoint, path, query);

        let mut request = self.client.get(&url).header("authorization", authorization);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StoreError::UpstreamStatus(response.status().as_u16()));
        }

        Ok(extract_keys(&response.text().await?))
    }

    fn base_headers(&self, payload_hash: &str) -> BTreeMap<String, String> {
        let host = self
            .config
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();

        BTreeMap::from([
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date(OffsetDateTime::now_utc())),
            (
                "x-amz-content-sha256".to_string(),
                payload_hash.to_string(),
            ),
        ])
    }

    /// SigV4 `Authorization` header for a request whose signed headers are
    /// exactly `headers`.
    fn authorization(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
    ) -> String {
        let datetime = headers
            .get("x-amz-date")
            .cloned()
            .unwrap_or_default();
        let date = &datetime[..8];
        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers: Vec<&str> = headers.keys().map(String::as_str).collect();
        let signed_headers = signed_headers.join(";");

        let canonical_request = format!(
            "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{datetime}\n{scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let mut key = hmac(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date.as_bytes(),
        );
        key = hmac(&key, self.config.region.as_bytes());
        key = hmac(&key, b"s3");
        key = hmac(&key, b"aws4_request");
        let signature = hex(&hmac(&key, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key
        )
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_sha256(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn amz_date(ts: OffsetDateTime) -> String {
    let description =
        format_description!("[year][month][day]T[hour][minute][second]Z");
    ts.format(&description).unwrap_or_default()
}

/// Percent-encode for SigV4 canonical URIs/queries.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());

    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }

    encoded
}

/// Pull `<Key>` values out of a ListObjectsV2 response.
fn extract_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find("<Key>") {
        rest = &rest[start + 5..];
        let Some(end) = rest.find("</Key>") else {
            break;
        };
        keys.push(rest[..end].to_string());
        rest = &rest[end + 6..];
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a/b c.txt", false), "a/b%20c.txt");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("safe-._~", true), "safe-._~");
    }

    #[test]
    fn test_extract_keys() {
        let xml = "<ListBucketResult><Contents><Key>1/2/a.js</Key></Contents>\
                   <Contents><Key>1/2/b.css</Key></Contents></ListBucketResult>";
        assert_eq!(extract_keys(xml), vec!["1/2/a.js", "1/2/b.css"]);
        assert!(extract_keys("<Empty/>").is_empty());
    }

    #[test]
    fn test_amz_date_format() {
        let ts = time::macros::datetime!(2024-05-01 12:30:45 UTC);
        assert_eq!(amz_date(ts), "20240501T123045Z");
    }

    #[test]
    fn test_authorization_shape() {
        let store = S3Store::new(S3Config {
            endpoint: "https://s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            bucket: "stormkit".to_string(),
            access_key: "AKIA".to_string(),
            secret_key: "secret".to_string(),
        });

        let headers = BTreeMap::from([
            ("host".to_string(), "s3.example.com".to_string()),
            ("x-amz-date".to_string(), "20240501T123045Z".to_string()),
            ("x-amz-content-sha256".to_string(), hex_sha256(b"")),
        ]);

        let auth = store.authorization("GET", "/bucket/key", "", &headers, &hex_sha256(b""));
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIA/20240501/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
    }
}
