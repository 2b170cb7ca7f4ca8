use clap::Parser;
use colored::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "coverart-dl",
    about = "Build cover-art download manifests from MusicBrainz tag searches"
)]
struct Args {
    /// Mode: scrape (fetch + filter release groups) or dl (batch + download covers)
    mode: String,

    /// Genre tag to search
    #[arg(short, long, default_value = "death metal")]
    tag: String,

    /// Max results to fetch per run (also the download batch size)
    #[arg(long, default_value = "1000")]
    max: usize,

    /// Resume from the offset saved in the last run's config
    #[arg(long)]
    resume: bool,

    /// Start download from release n.
    #[arg(long, default_value = "0")]
    start: usize,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const CONF_DIR: &str = "./config";
const DEFAULT_CONF: &str = "./config/coverart_default.json";
const RESUME_CONF: &str = "./config/resume.json";

const RELEASES_RAW: &str = "releases.json";
const RELEASES_CLEAN: &str = "releases_clean.json";
const RELEASES_REJECTED: &str = "releases_rejected.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    tag: String,
    release_types: Vec<String>,
    last_release: usize,
    max_releases: usize,
    dl_main_folder: String,
    #[serde(default)]
    dataset_path: String,
    #[serde(default = "default_downloader")]
    downloader: String,
    #[serde(default = "default_connections")]
    connections: u32,
    #[serde(default = "default_connections")]
    parallel: u32,
    /// The batch upper bound historically stopped one short of the final
    /// release in the list. Set this to also process that last entry.
    #[serde(default)]
    include_last_release: bool,
}

fn default_downloader() -> String {
    "aria2c".to_string()
}

fn default_connections() -> u32 {
    4
}

fn load_config(path: &Path) -> Result<Config, String> {
    let body = fs::read_to_string(path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    let config: Config = serde_json::from_str(&body)
        .map_err(|e| format!("Cannot parse config {}: {}", path.display(), e))?;
    println!("  {} Loaded configuration from {}", "✓".green(), path.display());
    Ok(config)
}

fn save_config(config: &Config, path: &Path) -> Result<(), String> {
    let body = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Cannot serialize config: {}", e))?;
    fs::write(path, body)
        .map_err(|e| format!("Cannot write config {}: {}", path.display(), e))?;
    println!("  {} Configuration saved in {}", "✓".green(), path.display());
    Ok(())
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), String> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Cannot serialize {}: {}", path.display(), e))?;
    fs::write(path, body).map_err(|e| format!("Cannot write {}: {}", path.display(), e))
}

// ---------------------------------------------------------------------------
// MusicBrainz API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MbSearchResult {
    count: u64,
    #[serde(rename = "release-groups", default)]
    release_groups: Vec<RawReleaseGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawReleaseGroup {
    id: String,
    title: String,
    #[serde(rename = "artist-credit")]
    artist_credit: Option<Vec<MbArtistCredit>>,
    #[serde(rename = "primary-type")]
    primary_type: Option<String>,
    #[serde(rename = "secondary-types")]
    secondary_types: Option<Vec<String>>,
    #[serde(default)]
    releases: Vec<MbReleaseRef>,
    #[serde(default)]
    tags: Vec<MbTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MbArtistCredit {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MbReleaseRef {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MbTag {
    name: String,
}

// Cover Art Archive
#[derive(Debug, Deserialize)]
struct CoverArtList {
    #[serde(default)]
    images: Vec<CoverImage>,
}

#[derive(Debug, Deserialize)]
struct CoverImage {
    image: String,
    #[serde(default)]
    types: Vec<String>,
}

// ---------------------------------------------------------------------------
// API clients
// ---------------------------------------------------------------------------

const MB_BASE: &str = "https://musicbrainz.org/ws/2";
const CAA_BASE: &str = "https://coverartarchive.org";
const USER_AGENT: &str = "coverart-dl/0.1.0 ( https://github.com/coverart-dl )";
const LIMIT: usize = 100;

async fn api_get(client: &Client, url: &str) -> Result<String, String> {
    let resp = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| format!("Request failed: {}", e))?;

    let status = resp.status().as_u16();
    if status != 200 {
        return Err(format!("HTTP {} for {}", status, url));
    }

    resp.text().await.map_err(|e| format!("Read body failed: {}", e))
}

/// One search page of release groups matching the tag query.
async fn mb_search_page(
    client: &Client,
    api_base: &str,
    tag: &str,
    limit: usize,
    offset: usize,
) -> Result<MbSearchResult, String> {
    let query = format!("tag:\"{}\"", tag);
    let encoded = urlencoding::encode(&query);
    let url = format!(
        "{}/release-group?query={}&limit={}&offset={}&fmt=json",
        api_base, encoded, limit, offset
    );
    let body = api_get(client, &url).await?;
    serde_json::from_str(&body).map_err(|e| format!("Parse error: {}", e))
}

/// Total number of release groups matching the tag (progress reporting only).
async fn mb_search_count(client: &Client, api_base: &str, tag: &str) -> Result<u64, String> {
    let query = format!("tag:\"{}\"", tag);
    let encoded = urlencoding::encode(&query);
    let url = format!("{}/release-group?query={}&fmt=json", api_base, encoded);
    let body = api_get(client, &url).await?;
    let result: MbSearchResult =
        serde_json::from_str(&body).map_err(|e| format!("Parse error: {}", e))?;
    Ok(result.count)
}

/// Image list for one release id. `Ok(None)` means the archive has nothing
/// indexed for that release (HTTP 404); any other failure propagates.
async fn fetch_cover_list(
    client: &Client,
    caa_base: &str,
    release_id: &str,
) -> Result<Option<CoverArtList>, String> {
    let url = format!("{}/release/{}", caa_base, release_id);
    let resp = client
        .get(&url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| format!("Request failed: {}", e))?;

    let status = resp.status().as_u16();
    if status == 404 {
        return Ok(None);
    }
    if status != 200 {
        return Err(format!("HTTP {} for {}", status, url));
    }

    resp.json::<CoverArtList>()
        .await
        .map(Some)
        .map_err(|e| format!("Parse error: {}", e))
}

// ---------------------------------------------------------------------------
// Name sanitizing
// ---------------------------------------------------------------------------

const BAD_CHARS: &[char] = &[
    '!', '"', '£', '$', '%', '&', '/', '(', ')', '=', '?', '^', ',', ';', ':', '>', '<', '\\',
    '*', '-',
];

fn clean_name(name: &str) -> String {
    name.chars()
        .filter(|c| !BAD_CHARS.contains(c))
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

// ---------------------------------------------------------------------------
// Release type filtering
// ---------------------------------------------------------------------------

/// A non-empty secondary-types list decides on its own: the release is wanted
/// iff at least one secondary type is in `wanted`, regardless of the primary
/// type. Without secondary types the primary type decides. Neither field
/// present means not wanted.
fn wants_release(rg: &RawReleaseGroup, wanted: &[String]) -> bool {
    match rg.secondary_types.as_deref() {
        Some(secondary) if !secondary.is_empty() => {
            secondary.iter().any(|s| wanted.iter().any(|w| w == s))
        }
        _ => match rg.primary_type {
            Some(ref primary) => wanted.iter().any(|w| w == primary),
            None => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Catalog fetching
// ---------------------------------------------------------------------------

/// Fetches all release groups for the configured tag in the offset window
/// `[last_release, last_release + max_releases)`, one page of LIMIT at a
/// time, in server order. Any failed page aborts the whole fetch.
async fn get_releases(
    client: &Client,
    api_base: &str,
    config: &Config,
) -> Result<Vec<RawReleaseGroup>, String> {
    let start = config.last_release;
    let stop = start + config.max_releases;

    let num_releases = mb_search_count(client, api_base, &config.tag).await?;
    println!(
        "  {} {} returned {} releases. Fetching releases from {} to {}",
        "→".bright_black(),
        config.tag.bright_cyan(),
        num_releases,
        start,
        stop
    );

    let total_pages = (config.max_releases + LIMIT - 1) / LIMIT;
    let mut releases = Vec::new();
    let mut offset = start;
    let mut page = 0usize;

    while offset < stop {
        page += 1;
        let chunk = mb_search_page(client, api_base, &config.tag, LIMIT, offset).await?;
        println!(
            "  {} {} fetched {} release groups (offset {})",
            format!("[{}/{}]", page, total_pages).bright_blue().bold(),
            "✓".green(),
            chunk.release_groups.len(),
            offset
        );
        releases.extend(chunk.release_groups);
        offset += LIMIT;
    }

    Ok(releases)
}

// ---------------------------------------------------------------------------
// Release list cleaning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CleanRelease {
    artist: String,
    title: String,
    releases: Vec<String>,
    tags: Vec<String>,
}

fn credited_artist(rg: &RawReleaseGroup) -> String {
    rg.artist_credit
        .as_ref()
        .and_then(|credits| credits.first())
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "unlisted".to_string())
}

/// Partitions raw release groups into wanted (sanitized) and refused (kept
/// verbatim for audit), preserving input order on both sides.
fn clean_releases_list(
    releases: Vec<RawReleaseGroup>,
    wanted: &[String],
) -> (Vec<CleanRelease>, Vec<RawReleaseGroup>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for rg in releases {
        let artist = credited_artist(&rg);

        if !wants_release(&rg, wanted) {
            println!("  {} {} - {} : refused", "✗".red(), artist, rg.title);
            rejected.push(rg);
            continue;
        }

        accepted.push(CleanRelease {
            artist: clean_name(&artist),
            title: clean_name(&rg.title),
            releases: rg.releases.iter().map(|r| r.id.clone()).collect(),
            tags: rg.tags.iter().map(|t| t.name.clone()).collect(),
        });
    }

    (accepted, rejected)
}

// ---------------------------------------------------------------------------
// Image manifest building
// ---------------------------------------------------------------------------

const EXCLUDED_IMAGE_TYPES: &[&str] = &["Medium", "Tray", "Booklet"];

#[derive(Debug, Clone, PartialEq)]
struct ManifestEntry {
    artist: String,
    folder_key: String,
    image_urls: Vec<String>,
}

fn keep_image(img: &CoverImage) -> bool {
    !img.types.iter().any(|t| EXCLUDED_IMAGE_TYPES.contains(&t.as_str()))
}

fn folder_key(release: &CleanRelease) -> String {
    format!("{}_-_{}", release.artist, release.title)
}

/// Upper bound of the manifest slice starting at `start`. By default the
/// bound is clamped to `len - 1`, which leaves the final release of the full
/// list out of every batch; `include_last` lifts the clamp to `len`.
fn manifest_stop(start: usize, max_count: usize, len: usize, include_last: bool) -> usize {
    let upper = if include_last { len } else { len.saturating_sub(1) };
    (start + max_count).min(upper)
}

/// Builds one manifest entry per release in `[start, stop)`. Release ids with
/// no cover art indexed contribute zero images; releases whose every id comes
/// up empty still get an entry so their folder is created downstream.
async fn build_manifest(
    client: &Client,
    caa_base: &str,
    releases: &[CleanRelease],
    start: usize,
    max_count: usize,
    include_last: bool,
) -> Result<Vec<ManifestEntry>, String> {
    let stop = manifest_stop(start, max_count, releases.len(), include_last);
    let mut entries = Vec::new();

    for release in releases.iter().take(stop).skip(start) {
        let key = folder_key(release);
        let mut image_urls = Vec::new();

        for id in &release.releases {
            match fetch_cover_list(client, caa_base, id).await? {
                Some(list) => {
                    image_urls.extend(list.images.into_iter().filter(keep_image).map(|i| i.image));
                }
                None => {
                    println!(
                        "    {} no cover art indexed for release {}",
                        "✗".yellow(),
                        id.bright_black()
                    );
                }
            }
        }

        println!(
            "  {} {} : {} images",
            "✓".green(),
            key.bright_cyan(),
            image_urls.len()
        );
        entries.push(ManifestEntry {
            artist: release.artist.clone(),
            folder_key: key,
            image_urls,
        });
    }

    Ok(entries)
}

// ---------------------------------------------------------------------------
// Batch partitioning and manifest writing
// ---------------------------------------------------------------------------

fn num_batches(n: usize, max_dl: usize) -> usize {
    n / max_dl + 1
}

fn release_dir(dataset_path: &Path, entry: &ManifestEntry) -> PathBuf {
    dataset_path.join(&entry.artist).join(&entry.folder_key)
}

/// Two lines per image URL: the URL, then a dir= line naming the release's
/// destination directory. This is the input-file format the bulk downloader
/// consumes.
fn render_manifest(entries: &[ManifestEntry], dataset_path: &Path) -> String {
    let mut out = String::new();
    for entry in entries {
        let dest = release_dir(dataset_path, entry);
        for url in &entry.image_urls {
            out.push_str(url);
            out.push('\n');
            out.push_str(&format!("dir={}\n", dest.display()));
        }
    }
    out
}

fn create_batch_dirs(entries: &[ManifestEntry], dataset_path: &Path) -> Result<(), String> {
    fs::create_dir_all(dataset_path)
        .map_err(|e| format!("Cannot create {}: {}", dataset_path.display(), e))?;
    for entry in entries {
        let dest = release_dir(dataset_path, entry);
        fs::create_dir_all(&dest).map_err(|e| format!("Cannot create {}: {}", dest.display(), e))?;
    }
    Ok(())
}

fn write_manifest(
    entries: &[ManifestEntry],
    dataset_path: &Path,
    batch: usize,
) -> Result<PathBuf, String> {
    let manifest_path = dataset_path.join(format!("batch_{}.txt", batch));
    let body = render_manifest(entries, dataset_path);
    fs::write(&manifest_path, body)
        .map_err(|e| format!("Cannot write manifest for batch {}: {}", batch, e))?;
    Ok(manifest_path)
}

/// Launches the external downloader on one manifest file and drains its
/// stdout to the console. A non-zero exit is logged and tolerated; failing
/// to launch at all is fatal.
async fn run_downloader(config: &Config, manifest_path: &Path, batch: usize) -> Result<(), String> {
    let mut child = tokio::process::Command::new(&config.downloader)
        .arg("-i")
        .arg(manifest_path)
        .arg("-x")
        .arg(config.connections.to_string())
        .arg("-j")
        .arg(config.parallel.to_string())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| {
            format!("Cannot launch {} for batch {}: {}", config.downloader, batch, e)
        })?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("    {}", line.bright_black());
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("Downloader wait failed on batch {}: {}", batch, e))?;
    if !status.success() {
        println!(
            "  {} downloader exited with {} on batch {}",
            "✗".yellow(),
            status,
            batch
        );
    }

    Ok(())
}

/// Processes the clean release list in fixed-size batches starting at
/// `start`: fetch image lists, create destination folders, write the batch
/// manifest, hand it to the downloader, then checkpoint the offset.
async fn run_download(
    client: &Client,
    caa_base: &str,
    config: &mut Config,
    config_path: &Path,
    releases: &[CleanRelease],
    start: usize,
) -> Result<(), String> {
    let max_dl = config.max_releases;
    if max_dl == 0 {
        return Err("max_releases must be greater than 0".to_string());
    }

    let dataset_path = PathBuf::from(&config.dataset_path);
    let remaining = releases.len().saturating_sub(start);
    let batches = num_batches(remaining, max_dl);
    println!(
        "  {} {} releases from offset {}, {} batches of up to {}",
        "→".bright_black(),
        remaining,
        start,
        batches,
        max_dl
    );

    for b in 0..batches {
        let batch_start = start + b * max_dl;
        println!(
            "\n{} {}",
            format!("[batch {}/{}]", b + 1, batches).bright_blue().bold(),
            format!("releases {}..", batch_start).white()
        );

        let entries = build_manifest(
            client,
            caa_base,
            releases,
            batch_start,
            max_dl,
            config.include_last_release,
        )
        .await?;

        create_batch_dirs(&entries, &dataset_path)?;
        let manifest_path = write_manifest(&entries, &dataset_path, b)?;
        println!(
            "  {} manifest written to {}",
            "✓".green(),
            manifest_path.display()
        );

        run_downloader(config, &manifest_path, b).await?;

        config.last_release = batch_start + entries.len();
        save_config(config, config_path)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

async fn run_scrape(
    client: &Client,
    api_base: &str,
    config: &mut Config,
    config_path: &Path,
    out_dir: &Path,
) -> Result<(), String> {
    println!(
        "{} Looking for releases tagged {}",
        "→".bright_black(),
        config.tag.bright_cyan().bold()
    );

    let releases = get_releases(client, api_base, config).await?;
    save_json(&releases, &out_dir.join(RELEASES_RAW))?;

    let (accepted, rejected) = clean_releases_list(releases, &config.release_types);
    println!(
        "\n  {} clean release list contains {} releases ({} refused)",
        "✓".green(),
        accepted.len().to_string().bright_white().bold(),
        rejected.len()
    );

    save_json(&accepted, &out_dir.join(RELEASES_CLEAN))?;
    save_json(&rejected, &out_dir.join(RELEASES_REJECTED))?;

    // Next scrape continues where this window ended.
    config.last_release += config.max_releases;
    save_config(config, config_path)?;

    Ok(())
}

async fn run_dl(
    client: &Client,
    caa_base: &str,
    config: &mut Config,
    config_path: &Path,
    start: usize,
    out_dir: &Path,
) -> Result<(), String> {
    println!(
        "{} Downloading covers for releases tagged {}",
        "→".bright_black(),
        config.tag.bright_cyan().bold()
    );

    let clean_path = out_dir.join(RELEASES_CLEAN);
    let body = fs::read_to_string(&clean_path)
        .map_err(|e| format!("Cannot read {}: run scrape first ({})", clean_path.display(), e))?;
    let releases: Vec<CleanRelease> = serde_json::from_str(&body)
        .map_err(|e| format!("Cannot parse {}: {}", clean_path.display(), e))?;

    run_download(client, caa_base, config, config_path, &releases, start).await
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("{}", "CoverArtDownload v0.1".bold());
    println!("=====================");
    println!();

    let (mut config, config_path) = if args.resume {
        let pointer = fs::read_to_string(RESUME_CONF)
            .ok()
            .and_then(|body| serde_json::from_str::<String>(&body).ok());
        let path = match pointer {
            Some(p) => PathBuf::from(p),
            None => {
                eprintln!("{}", "Nothing to resume, check your config file paths".red());
                std::process::exit(1);
            }
        };
        let config = match load_config(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e.red());
                std::process::exit(1);
            }
        };
        (config, path)
    } else {
        let mut config = match load_config(Path::new(DEFAULT_CONF)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e.red());
                eprintln!("{}", "Something went wrong, check your config file paths".red());
                std::process::exit(1);
            }
        };

        config.tag = args.tag.clone();
        config.max_releases = args.max;
        if args.start > 0 {
            config.last_release = args.start;
        }

        let dataset_folder = config.tag.replace(' ', "_");
        config.dataset_path = Path::new(&config.dl_main_folder)
            .join(&dataset_folder)
            .to_string_lossy()
            .to_string();

        fs::create_dir_all(CONF_DIR).ok();
        let config_path = Path::new(CONF_DIR).join(format!("{}.json", dataset_folder));
        if let Err(e) = save_config(&config, &config_path) {
            eprintln!("{}", e.red());
            std::process::exit(1);
        }
        if let Err(e) = save_json(&config_path.to_string_lossy().to_string(), Path::new(RESUME_CONF))
        {
            eprintln!("{}", e.red());
            std::process::exit(1);
        }

        (config, config_path)
    };

    println!();
    println!("Tag       : {}", config.tag.bright_cyan());
    println!(
        "Window    : {} .. {}",
        config.last_release,
        config.last_release + config.max_releases
    );
    println!("Types     : {}", config.release_types.join(", "));
    println!("Dataset   : {}", config.dataset_path);
    println!();

    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client");

    let result = match args.mode.as_str() {
        "scrape" => run_scrape(&client, MB_BASE, &mut config, &config_path, Path::new(".")).await,
        "dl" => {
            let start = if args.resume { config.last_release } else { args.start };
            run_dl(&client, CAA_BASE, &mut config, &config_path, start, Path::new(".")).await
        }
        other => {
            eprintln!("{}", format!("Invalid mode '{}', exiting", other).red());
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("\n{}", e.red().bold());
        std::process::exit(1);
    }

    println!("\n{}", "Done".green().bold());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
