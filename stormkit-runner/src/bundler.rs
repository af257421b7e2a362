//! Phase B: bundling.
//!
//! Resolves the deployment's output convention into the canonical three
//! buckets (client / server / api), inlines the node packages a server
//! payload needs, writes the API wrapper, builds the manifest entries with
//! content ETags and produces the three artifact zips.

use crate::deps::{DependencyTree, PackageJson, find_declared_dependencies};
use crate::headers_file::parse_headers_file;
use crate::redirects_file::parse_redirects;
use crate::reporter::Reporter;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use stormkit_core::{ApiFile, CdnFile, HeaderRule, RedirectRule, apply_header_rules};
use thiserror::Error;

/// Wrapper installed as the API entry point.
const API_WRAPPER: &str = include_str!("assets/stormkit-api.mjs");
const API_WRAPPER_NAME: &str = "stormkit-api.mjs";

pub const STORMKIT_PUBLIC_FOLDER: &str = ".stormkit/public";
pub const STORMKIT_SERVER_FOLDER: &str = ".stormkit/server";
pub const STORMKIT_API_FOLDER: &str = ".stormkit/api";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("cannot auto detect serverless entry file: expecting (index|server).{{js,mjs,cjs}}")]
    NoServerEntry,

    #[error(transparent)]
    Redirects(#[from] crate::redirects_file::RedirectsError),
}

#[derive(Debug, Clone, Default)]
pub struct BundlerOpts {
    /// Build working directory (may be a subdirectory of the repo).
    pub work_dir: PathBuf,
    /// Repository root.
    pub repo_dir: PathBuf,
    /// Where the zips are produced.
    pub dist_dir: PathBuf,
    /// Explicit output folder override.
    pub dist_folder: String,
    /// Explicit server output folder.
    pub server_folder: String,
    /// Long-running server command, when the deployment runs one.
    pub server_cmd: String,
    pub redirects_file: String,
    pub headers_file: String,
    pub package_json: Option<PackageJson>,
}

/// The bundling result: resolved directories, handlers, manifest inputs
/// and the produced zips.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    work_dir: PathBuf,
    pub client_dirs: Vec<String>,
    pub server_dirs: Vec<String>,
    pub api_dirs: Vec<String>,
    /// `file:handler` for the serverless renderer.
    pub function_handler: String,
    /// `file:handler` for the api entry.
    pub api_handler: String,
    pub redirects: Vec<RedirectRule>,
    pub headers: Vec<HeaderRule>,
    /// The api bucket was derived automatically from the client output.
    pub is_api_auto_built: bool,

    pub client_zip: Option<PathBuf>,
    pub server_zip: Option<PathBuf>,
    pub api_zip: Option<PathBuf>,
}

impl Artifacts {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    /// Manifest entries for the CDN bucket: every client file with its
    /// ETag and applicable per-path headers, deduplicated across dirs.
    pub fn cdn_files(&self) -> Vec<CdnFile> {
        let mut files = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for dir in &self.client_dirs {
            let full_path = self.work_dir.join(dir);
            for file in walk_files(&full_path) {
                let name = manifest_name(&full_path, &file);
                if name.is_empty() || seen.contains(&name) {
                    continue;
                }
                if self.is_api_auto_built && name.starts_with("/api") {
                    continue;
                }

                let base = std::collections::HashMap::from([(
                    "etag".to_string(),
                    etag(&file, false),
                )]);

                seen.insert(name.clone());
                files.push(CdnFile {
                    headers: apply_header_rules(&name, base, &self.headers),
                    name,
                });
            }
        }

        files
    }

    /// Manifest entries for the api bucket. Private files (leading `_`),
    /// spec files, non-js files and the wrapper itself are excluded.
    pub fn api_files(&self) -> Vec<ApiFile> {
        let mut files = Vec::new();

        for dir in &self.api_dirs {
            let full_path = self.work_dir.join(dir);
            for file in walk_files(&full_path) {
                let name = manifest_name(&full_path, &file);
                if name.is_empty()
                    || name.starts_with("/_")
                    || !name.ends_with("js")
                    || name.contains(".spec.")
                    || name.starts_with("/stormkit-api.")
                {
                    continue;
                }

                files.push(ApiFile { file_name: name });
            }
        }

        files
    }
}

/// Resolve the three output directory sets for a deployment.
///
/// Precedence: `.stormkit/{public,server,api}`, then a dist folder with
/// `{public|static|client|browser, server}` subfolders, then the whole
/// dist folder as client content.
pub fn dist_dirs(opts: &BundlerOpts) -> (Vec<String>, Vec<String>, Vec<String>) {
    let exists = |relative: &str| opts.work_dir.join(relative).exists();

    let mut client_dirs = Vec::new();
    let mut server_dirs = Vec::new();
    let mut api_dirs = Vec::new();

    // A top-level public folder ships by default.
    if exists("public") {
        client_dirs.push("public".to_string());
    }

    if exists(STORMKIT_API_FOLDER) {
        api_dirs.push(STORMKIT_API_FOLDER.to_string());
    }

    let has_stormkit_public = exists(STORMKIT_PUBLIC_FOLDER);
    let has_stormkit_server = exists(STORMKIT_SERVER_FOLDER);

    if has_stormkit_public {
        client_dirs.push(STORMKIT_PUBLIC_FOLDER.to_string());
    }
    if has_stormkit_server {
        server_dirs.push(STORMKIT_SERVER_FOLDER.to_string());
    }
    if has_stormkit_public || has_stormkit_server {
        return (client_dirs, server_dirs, api_dirs);
    }

    let dist_dir = find_dist_dir(opts);

    // Server-command deployments treat the dist folder as the server
    // payload.
    if !opts.server_cmd.is_empty() || !opts.server_folder.is_empty() {
        let server = if !dist_dir.is_empty() {
            dist_dir
        } else {
            opts.server_folder.clone()
        };
        return (client_dirs, vec![server], api_dirs);
    }

    if dist_dir.is_empty() {
        return (client_dirs, server_dirs, api_dirs);
    }

    let mut changed = false;
    for subfolder in ["public", "static", "client", "browser"] {
        let candidate = format!("{dist_dir}/{subfolder}");
        if exists(&candidate) {
            client_dirs.push(candidate);
            changed = true;
            break;
        }
    }

    let server_candidate = format!("{dist_dir}/server");
    if exists(&server_candidate) {
        server_dirs.push(server_candidate);
        changed = true;
    }

    if !changed {
        client_dirs.push(dist_dir);
    }

    (client_dirs, server_dirs, api_dirs)
}

fn find_dist_dir(opts: &BundlerOpts) -> String {
    if !opts.dist_folder.is_empty() {
        return opts.dist_folder.clone();
    }

    for candidate in ["dist", "build", "output", "out"] {
        if opts.work_dir.join(candidate).exists() {
            return candidate.to_string();
        }
    }

    String::new()
}

pub struct Bundler {
    opts: BundlerOpts,
    reporter: Reporter,
    client_dirs: Vec<String>,
    server_dirs: Vec<String>,
    api_dirs: Vec<String>,
}

impl Bundler {
    pub fn new(opts: BundlerOpts, reporter: Reporter) -> std::io::Result<Self> {
        std::fs::create_dir_all(&opts.dist_dir)?;
        let (client_dirs, server_dirs, api_dirs) = dist_dirs(&opts);

        Ok(Self {
            opts,
            reporter,
            client_dirs,
            server_dirs,
            api_dirs,
        })
    }

    /// Assemble the three buckets and their handlers.
    pub fn bundle(&self) -> Result<Artifacts, BundleError> {
        let mut artifacts = Artifacts::new(&self.opts.work_dir);

        let (server_dirs, function_handler) = self.bundle_server_side()?;
        artifacts.server_dirs = server_dirs;
        artifacts.function_handler = function_handler;

        let (api_dirs, api_handler) = self.bundle_api_folder()?;
        artifacts.is_api_auto_built = !api_dirs.is_empty();
        artifacts.api_dirs = api_dirs;
        artifacts.api_handler = api_handler;

        artifacts.client_dirs = self
            .client_dirs
            .iter()
            .filter(|dir| self.opts.work_dir.join(dir).exists())
            .cloned()
            .collect();

        // Nothing recognized: ship the whole folder as client content.
        if artifacts.server_dirs.is_empty()
            && artifacts.client_dirs.is_empty()
            && artifacts.api_dirs.is_empty()
        {
            artifacts.client_dirs = vec![".".to_string()];
        }

        Ok(artifacts)
    }

    fn bundle_server_side(&self) -> Result<(Vec<String>, String), BundleError> {
        if self.opts.server_cmd.is_empty() && self.server_dirs.is_empty() {
            return Ok((Vec::new(), String::new()));
        }

        let function_handler = ".:server".to_string();

        // The whole folder runs as the server (go, python, ...).
        if self.server_dirs.len() == 1 && self.server_dirs[0].is_empty() {
            return Ok((vec![".".to_string()], function_handler));
        }

        // Serverless output under .stormkit/server.
        if self.server_dirs.len() == 1 && self.server_dirs[0] == STORMKIT_SERVER_FOLDER {
            return self.bundle_stormkit_server_folder();
        }

        // Server-command deployment: bundle the packages the command needs
        // next to the payload.
        let mut command_deps = self.find_server_dependencies(&self.opts.server_cmd);
        command_deps.retain(|dep| !dep.is_empty());

        let mut resolved_bins = Vec::new();
        for dep in &command_deps {
            if let Some(package) = self.resolve_bin_package(dep) {
                resolved_bins.push(package);
            }
        }

        let mut server_dirs = Vec::new();
        for dir in &self.server_dirs {
            let absolute = self.opts.work_dir.join(dir);
            if dir.is_empty() || !absolute.exists() {
                continue;
            }

            match self.resolved_dependency_dirs(&absolute, &resolved_bins) {
                Ok(deps) => server_dirs.extend(deps),
                Err(e) => {
                    tracing::error!("error while bundling dependencies: {e}");
                    continue;
                }
            }

            server_dirs.push(trim_dir(dir));
        }

        server_dirs.dedup();
        Ok((server_dirs, function_handler))
    }

    /// Work-dir-relative paths a server payload needs in its zip:
    /// `package.json`, the `.bin` shims, and each resolved package.
    fn resolved_dependency_dirs(
        &self,
        scan_dir: &Path,
        extra_deps: &[String],
    ) -> Result<Vec<String>, BundleError> {
        let Some(package_json) = &self.opts.package_json else {
            return Ok(Vec::new());
        };

        let declared = package_json.declared();
        let mut requested = package_json.bundle_seed();
        requested.extend(find_declared_dependencies(scan_dir, &declared)?);
        requested.extend(extra_deps.iter().cloned());
        requested.retain(|dep| dep != "*");

        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let mut tree =
            DependencyTree::new(requested, self.opts.work_dir.join("node_modules"));
        tree.walk();

        let mut dirs = vec!["package.json".to_string(), "node_modules/.bin".to_string()];
        for dep in tree.resolved_dependencies() {
            dirs.push(format!("node_modules/{}", dep.name));
        }

        Ok(dirs)
    }

    /// `.stormkit/server` output: auto-detect the entry file and inline
    /// the required node_modules into the folder, because only this folder
    /// is deployed.
    fn bundle_stormkit_server_folder(&self) -> Result<(Vec<String>, String), BundleError> {
        let server_path = self.opts.work_dir.join(STORMKIT_SERVER_FOLDER);
        let (entry, handler) =
            auto_detect_server_file(&server_path).ok_or(BundleError::NoServerEntry)?;

        self.bundle_dependencies(&server_path, &[])?;

        Ok((
            vec![STORMKIT_SERVER_FOLDER.to_string()],
            format!("{entry}:{handler}"),
        ))
    }

    fn bundle_api_folder(&self) -> Result<(Vec<String>, String), BundleError> {
        for dir in &self.api_dirs {
            let absolute = self.opts.work_dir.join(dir);
            if dir.is_empty() || !absolute.exists() {
                continue;
            }

            std::fs::write(absolute.join(API_WRAPPER_NAME), API_WRAPPER)?;
            self.bundle_dependencies(&absolute, &[])?;

            return Ok((
                vec![dir.clone()],
                format!("{API_WRAPPER_NAME}:handler"),
            ));
        }

        Ok((Vec::new(), String::new()))
    }

    /// Copy the transitively required packages into
    /// `<destination>/node_modules`, preserving scoped layout.
    fn bundle_dependencies(
        &self,
        destination: &Path,
        extra_deps: &[String],
    ) -> Result<(), BundleError> {
        let Some(package_json) = &self.opts.package_json else {
            return Ok(());
        };

        let declared = package_json.declared();
        let mut requested = package_json.bundle_seed();
        requested.extend(find_declared_dependencies(destination, &declared)?);
        requested.extend(extra_deps.iter().cloned());
        requested.retain(|dep| dep != "*");

        if requested.is_empty() {
            return Ok(());
        }

        self.reporter.add_step("bundling server packages");

        let node_modules_src = self.opts.work_dir.join("node_modules");
        let mut tree = DependencyTree::new(requested.clone(), &node_modules_src);
        tree.walk();

        let node_modules_dst = destination.join("node_modules");
        std::fs::create_dir_all(&node_modules_dst)?;

        for dep in tree.resolved_dependencies() {
            if !dep.full_path.exists() {
                tracing::info!(
                    "bundling server package {} ignored because it is not installed",
                    dep.name
                );
                continue;
            }

            let target = node_modules_dst.join(&dep.name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_dir_recursive(&dep.full_path, &target)?;
        }

        let mut listed = requested;
        listed.sort();
        for dep in listed {
            self.reporter.add_line(&dep);
        }

        Ok(())
    }

    /// Command names a server command runs, following package.json script
    /// indirection (`npm run start` → the `start` script's commands).
    fn find_server_dependencies(&self, command: &str) -> Vec<String> {
        let mut deps = Vec::new();

        for part in split_commands(command) {
            match script_name(&part) {
                Some(script) => {
                    let resolved = self
                        .opts
                        .package_json
                        .as_ref()
                        .and_then(|p| p.scripts.get(&script))
                        .cloned();
                    if let Some(resolved) = resolved {
                        deps.extend(self.find_server_dependencies(&resolved));
                    }
                }
                None => {
                    if let Some(name) = part.split_whitespace().next() {
                        deps.push(name.to_string());
                    }
                }
            }
        }

        deps
    }

    /// Follow `node_modules/.bin/<name>` to the owning package.
    fn resolve_bin_package(&self, command: &str) -> Option<String> {
        let link = self.opts.work_dir.join("node_modules/.bin").join(command);
        let target = std::fs::read_link(&link).ok()?;
        let target = target.to_string_lossy();

        let relative = if let Some(stripped) = target.strip_prefix("../") {
            stripped.to_string()
        } else {
            target
                .replace(&self.opts.work_dir.to_string_lossy().to_string(), "")
                .trim_start_matches('/')
                .to_string()
        };

        let segments: Vec<&str> = relative.split('/').collect();
        match segments.first() {
            Some(scope) if scope.starts_with('@') && segments.len() > 1 => {
                Some(format!("{}/{}", scope, segments[1]))
            }
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => None,
        }
    }

    /// Parse the redirects and headers files into the artifacts.
    pub fn parse_redirects(&self, artifacts: &mut Artifacts) -> Result<(), BundleError> {
        artifacts.redirects = parse_redirects(
            &self.opts.work_dir,
            &self.opts.repo_dir,
            &self.opts.redirects_file,
        )?;
        Ok(())
    }

    pub fn parse_headers(&self, artifacts: &mut Artifacts) -> Result<(), BundleError> {
        if self.opts.headers_file.is_empty() {
            return Ok(());
        }

        let path = self.opts.work_dir.join(&self.opts.headers_file);
        let headers = match parse_headers_file(&path) {
            Ok(headers) => headers,
            Err(e) => {
                self.reporter.add_step("parsing headers file failed");
                self.reporter
                    .add_line(&format!("File not found: {}", path.display()));
                return Err(e.into());
            }
        };

        if headers.is_empty() {
            tracing::info!(
                "warning: headers file {} is specified but no headers were found",
                path.display()
            );
            return Ok(());
        }

        artifacts.headers = headers;
        Ok(())
    }

    /// Produce the three artifact zips. Empty buckets produce no zip.
    pub fn zip(&self, artifacts: &mut Artifacts) -> Result<(), BundleError> {
        let client_zip = self.opts.dist_dir.join("sk-client.zip");
        let server_zip = self.opts.dist_dir.join("sk-server.zip");
        let api_zip = self.opts.dist_dir.join("sk-api.zip");

        // Client and api content sits at the zip root; server payloads
        // keep their parent folders unless they come from .stormkit/server.
        let server_include_parent = artifacts
            .server_dirs
            .first()
            .is_none_or(|dir| dir != STORMKIT_SERVER_FOLDER);

        if zip_dirs(&self.opts.work_dir, &artifacts.client_dirs, &client_zip, false)? {
            artifacts.client_zip = Some(client_zip);
        }
        if zip_dirs(
            &self.opts.work_dir,
            &artifacts.server_dirs,
            &server_zip,
            server_include_parent,
        )? {
            artifacts.server_zip = Some(server_zip);
        }
        if zip_dirs(&self.opts.work_dir, &artifacts.api_dirs, &api_zip, false)? {
            artifacts.api_zip = Some(api_zip);
        }

        Ok(())
    }
}

/// Zip the given directories. Returns false when nothing was added.
fn zip_dirs(
    work_dir: &Path,
    dirs: &[String],
    zip_path: &Path,
    include_parent: bool,
) -> Result<bool, BundleError> {
    if dirs.is_empty() {
        return Ok(false);
    }

    let file = std::fs::File::create(zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut added = 0usize;
    let mut seen: HashSet<String> = HashSet::new();

    for dir in dirs {
        let base = work_dir.join(dir);

        if base.is_file() {
            // Single files (package.json) keep their relative name.
            let name = trim_dir(dir);
            if seen.insert(name.clone()) {
                writer.start_file(name, options)?;
                writer.write_all(&std::fs::read(&base)?)?;
                added += 1;
            }
            continue;
        }

        for file in walk_files(&base) {
            let relative = file
                .strip_prefix(&base)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");

            let name = if include_parent {
                let prefix = trim_dir(dir);
                if prefix.is_empty() {
                    relative.clone()
                } else {
                    format!("{prefix}/{relative}")
                }
            } else {
                relative.clone()
            };

            if !seen.insert(name.clone()) {
                continue;
            }

            // Broken symlinks (stale .bin shims) are skipped.
            let Ok(content) = std::fs::read(&file) else {
                continue;
            };
            writer.start_file(name, options)?;
            writer.write_all(&content)?;
            added += 1;
        }
    }

    writer.finish()?;

    if added == 0 {
        std::fs::remove_file(zip_path)?;
        return Ok(false);
    }
    Ok(true)
}

/// Content ETag: SHA-1 digest rendered as `"<hashlen>-<hex>"`; weak form
/// gets a `W/` prefix.
pub fn etag(file_path: &Path, weak: bool) -> String {
    let Ok(body) = std::fs::read(file_path) else {
        return String::new();
    };

    let hash = Sha1::digest(&body);
    let tag = format!("\"{}-{:x}\"", hash.len(), hash);

    if weak { format!("W/{tag}") } else { tag }
}

/// `(entry file, handler name)` for a serverless folder.
fn auto_detect_server_file(server_dir: &Path) -> Option<(String, String)> {
    for base in ["index", "server"] {
        for extension in [".js", ".mjs", ".cjs", ".ts", ".mts", ".cts"] {
            let file_name = format!("{base}{extension}");
            if server_dir.join(&file_name).is_file() {
                return Some((file_name, "handler".to_string()));
            }
        }
    }
    None
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        let mut children: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        children.sort();

        for child in children {
            if child.is_dir() {
                stack.push(child);
            } else {
                files.push(child);
            }
        }
    }

    files.sort();
    files
}

fn manifest_name(base: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(base).unwrap_or(file).to_string_lossy();
    if relative.is_empty() {
        return String::new();
    }
    format!("/{}", relative.replace('\\', "/"))
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(destination)?;

    for entry in std::fs::read_dir(source)?.flatten() {
        let path = entry.path();
        let target = destination.join(entry.file_name());

        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }

    Ok(())
}

/// Remove leading `./` and `/` markers from a directory entry.
fn trim_dir(dir: &str) -> String {
    let trimmed = dir.trim().trim_start_matches("./");
    if trimmed == "." {
        return String::new();
    }
    trimmed.trim_start_matches('/').to_string()
}

/// Split a shell command into its individual commands.
fn split_commands(command: &str) -> Vec<String> {
    command
        .split("&&")
        .flat_map(|part| part.split(';'))
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// The script a package-manager invocation runs, if any:
/// `npm run start`, `yarn start`, `pnpm run dev`, ...
fn script_name(command: &str) -> Option<String> {
    let fields: Vec<&str> = command.split_whitespace().collect();

    match fields.as_slice() {
        ["npm", "run", script, ..]
        | ["pnpm", "run", script, ..]
        | ["yarn", "run", script, ..]
        | ["bun", "run", script, ..] => Some(script.to_string()),
        ["yarn", script, ..] if !script.starts_with('-') => Some(script.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts_for(temp: &TempDir) -> BundlerOpts {
        BundlerOpts {
            work_dir: temp.path().to_path_buf(),
            repo_dir: temp.path().to_path_buf(),
            dist_dir: temp.path().join("sk-dist"),
            ..Default::default()
        }
    }

    fn touch(temp: &TempDir, relative: &str) {
        let path = temp.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"content").unwrap();
    }

    fn reporter(temp: &TempDir) -> Reporter {
        Reporter::new(temp.path().join("build.log")).unwrap()
    }

    #[test]
    fn test_dist_dirs_stormkit_convention() {
        let temp = TempDir::new().unwrap();
        touch(&temp, ".stormkit/public/index.html");
        touch(&temp, ".stormkit/server/index.mjs");
        touch(&temp, ".stormkit/api/users.mjs");

        let (client, server, api) = dist_dirs(&opts_for(&temp));
        assert_eq!(client, vec![STORMKIT_PUBLIC_FOLDER]);
        assert_eq!(server, vec![STORMKIT_SERVER_FOLDER]);
        assert_eq!(api, vec![STORMKIT_API_FOLDER]);
    }

    #[test]
    fn test_dist_dirs_dist_subfolders() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "dist/client/index.html");
        touch(&temp, "dist/server/index.mjs");

        let (client, server, _) = dist_dirs(&opts_for(&temp));
        assert_eq!(client, vec!["dist/client"]);
        assert_eq!(server, vec!["dist/server"]);
    }

    #[test]
    fn test_dist_dirs_whole_folder_as_client() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "build/index.html");

        let (client, server, _) = dist_dirs(&opts_for(&temp));
        assert_eq!(client, vec!["build"]);
        assert!(server.is_empty());
    }

    #[test]
    fn test_dist_dirs_public_included_by_default() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "public/favicon.ico");
        touch(&temp, "dist/browser/app.js");

        let (client, _, _) = dist_dirs(&opts_for(&temp));
        assert_eq!(client, vec!["public", "dist/browser"]);
    }

    #[test]
    fn test_dist_dirs_server_cmd_takes_dist_as_server() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "dist/index.mjs");

        let mut opts = opts_for(&temp);
        opts.server_cmd = "node dist/index.mjs".to_string();

        let (_, server, _) = dist_dirs(&opts);
        assert_eq!(server, vec!["dist"]);
    }

    #[test]
    fn test_etag_is_deterministic_sha1() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "a.txt");

        let first = etag(&temp.path().join("a.txt"), false);
        let second = etag(&temp.path().join("a.txt"), false);
        assert_eq!(first, second);
        assert!(first.starts_with("\"20-"));
        assert_eq!(first.len(), 2 + 3 + 40); // quotes + "20-" + sha1 hex

        let weak = etag(&temp.path().join("a.txt"), true);
        assert!(weak.starts_with("W/\"20-"));
    }

    #[test]
    fn test_auto_detect_server_file() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "out/server.cjs");
        assert_eq!(
            auto_detect_server_file(&temp.path().join("out")),
            Some(("server.cjs".to_string(), "handler".to_string()))
        );

        touch(&temp, "out/index.js");
        // index.* wins over server.*.
        assert_eq!(
            auto_detect_server_file(&temp.path().join("out")),
            Some(("index.js".to_string(), "handler".to_string()))
        );

        assert_eq!(auto_detect_server_file(&temp.path().join("missing")), None);
    }

    #[test]
    fn test_api_files_exclusions() {
        let temp = TempDir::new().unwrap();
        touch(&temp, ".stormkit/api/users.mjs");
        touch(&temp, ".stormkit/api/_private.mjs");
        touch(&temp, ".stormkit/api/users.spec.mjs");
        touch(&temp, ".stormkit/api/readme.md");
        touch(&temp, ".stormkit/api/stormkit-api.mjs");
        touch(&temp, ".stormkit/api/nested/orders.js");

        let mut artifacts = Artifacts::new(temp.path());
        artifacts.api_dirs = vec![STORMKIT_API_FOLDER.to_string()];

        let names: Vec<String> = artifacts.api_files().into_iter().map(|f| f.file_name).collect();
        assert_eq!(names, vec!["/nested/orders.js", "/users.mjs"]);
    }

    #[test]
    fn test_cdn_files_with_headers_and_dedupe() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "public/index.html");
        touch(&temp, ".stormkit/public/index.html");
        touch(&temp, ".stormkit/public/assets/app.js");

        let mut artifacts = Artifacts::new(temp.path());
        artifacts.client_dirs = vec![
            "public".to_string(),
            STORMKIT_PUBLIC_FOLDER.to_string(),
        ];
        artifacts.headers = vec![HeaderRule {
            path: "/assets/*".to_string(),
            headers: std::collections::HashMap::from([(
                "cache-control".to_string(),
                "public, max-age=31536000".to_string(),
            )]),
        }];

        let files = artifacts.cdn_files();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["/index.html", "/assets/app.js"]);

        let app_js = files.iter().find(|f| f.name == "/assets/app.js").unwrap();
        assert!(app_js.headers.get("etag").unwrap().starts_with("\"20-"));
        assert_eq!(
            app_js.headers.get("cache-control").unwrap(),
            "public, max-age=31536000"
        );
    }

    #[test]
    fn test_bundle_stormkit_server_requires_entry() {
        let temp = TempDir::new().unwrap();
        touch(&temp, ".stormkit/server/helper.mjs");

        let bundler = Bundler::new(opts_for(&temp), reporter(&temp)).unwrap();
        assert!(matches!(
            bundler.bundle(),
            Err(BundleError::NoServerEntry)
        ));
    }

    #[test]
    fn test_bundle_stormkit_server_with_entry_and_deps() {
        let temp = TempDir::new().unwrap();
        touch(&temp, ".stormkit/server/index.mjs");
        std::fs::write(
            temp.path().join(".stormkit/server/index.mjs"),
            "import cookie from 'cookie';",
        )
        .unwrap();
        touch(&temp, "node_modules/cookie/package.json");
        std::fs::write(
            temp.path().join("node_modules/cookie/package.json"),
            r#"{"name": "cookie"}"#,
        )
        .unwrap();

        let mut opts = opts_for(&temp);
        opts.package_json = Some(
            serde_json::from_str(r#"{"dependencies": {"cookie": "^1.0.0"}}"#).unwrap(),
        );

        let bundler = Bundler::new(opts, reporter(&temp)).unwrap();
        let artifacts = bundler.bundle().unwrap();

        assert_eq!(artifacts.function_handler, "index.mjs:handler");
        assert_eq!(artifacts.server_dirs, vec![STORMKIT_SERVER_FOLDER]);
        assert!(
            temp.path()
                .join(".stormkit/server/node_modules/cookie/package.json")
                .is_file()
        );
    }

    #[test]
    fn test_bundle_api_folder_writes_wrapper() {
        let temp = TempDir::new().unwrap();
        touch(&temp, ".stormkit/api/users.mjs");

        let bundler = Bundler::new(opts_for(&temp), reporter(&temp)).unwrap();
        let artifacts = bundler.bundle().unwrap();

        assert_eq!(artifacts.api_handler, "stormkit-api.mjs:handler");
        assert!(temp.path().join(".stormkit/api/stormkit-api.mjs").is_file());
        // The wrapper never enters the manifest.
        assert!(
            artifacts
                .api_files()
                .iter()
                .all(|f| f.file_name != "/stormkit-api.mjs")
        );
    }

    #[test]
    fn test_zip_produces_only_non_empty_archives() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "dist/index.html");

        let bundler = Bundler::new(opts_for(&temp), reporter(&temp)).unwrap();
        let mut artifacts = bundler.bundle().unwrap();
        bundler.zip(&mut artifacts).unwrap();

        let client_zip = artifacts.client_zip.expect("client zip expected");
        assert!(client_zip.is_file());
        assert!(artifacts.server_zip.is_none());
        assert!(artifacts.api_zip.is_none());

        let archive =
            zip::ZipArchive::new(std::fs::File::open(&client_zip).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names, vec!["index.html"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_bin_package_through_symlink() {
        let temp = TempDir::new().unwrap();
        touch(&temp, "node_modules/next/dist/bin/next");
        touch(&temp, "node_modules/@remix-run/serve/cli.js");
        std::fs::create_dir_all(temp.path().join("node_modules/.bin")).unwrap();
        std::os::unix::fs::symlink(
            "../next/dist/bin/next",
            temp.path().join("node_modules/.bin/next"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            "../@remix-run/serve/cli.js",
            temp.path().join("node_modules/.bin/remix-serve"),
        )
        .unwrap();

        let bundler = Bundler::new(opts_for(&temp), reporter(&temp)).unwrap();
        assert_eq!(bundler.resolve_bin_package("next"), Some("next".to_string()));
        assert_eq!(
            bundler.resolve_bin_package("remix-serve"),
            Some("@remix-run/serve".to_string())
        );
        assert_eq!(bundler.resolve_bin_package("missing"), None);
    }

    #[test]
    fn test_find_server_dependencies_follows_scripts() {
        let temp = TempDir::new().unwrap();
        let mut opts = opts_for(&temp);
        opts.package_json = Some(
            serde_json::from_str(
                r#"{"scripts": {"start": "node server.js && next start"}}"#,
            )
            .unwrap(),
        );
        opts.server_cmd = "npm run start".to_string();

        let bundler = Bundler::new(opts, reporter(&temp)).unwrap();
        let deps = bundler.find_server_dependencies("npm run start");
        assert_eq!(deps, vec!["node", "next"]);
    }

    #[test]
    fn test_split_commands_and_script_name() {
        assert_eq!(
            split_commands("a && b; c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(script_name("npm run start"), Some("start".to_string()));
        assert_eq!(script_name("yarn dev"), Some("dev".to_string()));
        assert_eq!(script_name("node index.js"), None);
    }
}
