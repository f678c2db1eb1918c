use std::collections::HashMap;
use std::fs::{self, File};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use super::error::{Result, ScrapeError};
use super::harvest::send_status;
use super::types::{BrowserArg, HarvestEvent, RunArgs};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A live W3C WebDriver session driven over plain HTTP.
pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
}

/// Attributes of one matched element, taken from a rendered DOM snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementSnapshot {
    attrs: HashMap<String, String>,
}

impl ElementSnapshot {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

impl WebDriverSession {
    pub async fn create(endpoint: &str, browser: BrowserArg, headless: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(40))
            .build()?;
        let base = endpoint.trim_end_matches('/').to_string();
        let caps = webdriver_capabilities(browser, headless);
        let value = send_command(
            client.post(format!("{base}/session")).json(&caps),
            "session create",
        )
        .await?;
        let session_id = value
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ScrapeError::WebDriver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })?;

        Ok(Self {
            client,
            base,
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_url(&self, tail: &str) -> String {
        format!("{}/session/{}{tail}", self.base, self.session_id)
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        send_command(
            self.client
                .post(self.session_url("/url"))
                .json(&json!({ "url": url })),
            "navigate",
        )
        .await?;
        Ok(())
    }

    pub async fn execute(&self, script: &str) -> Result<Value> {
        let mut value = send_command(
            self.client
                .post(self.session_url("/execute/sync"))
                .json(&json!({ "script": script, "args": [] })),
            "execute script",
        )
        .await?;
        Ok(value
            .get_mut("value")
            .map(Value::take)
            .unwrap_or_default())
    }

    /// Current location and serialized DOM of the page.
    pub async fn snapshot(&self) -> Result<(String, String)> {
        let script = r#"
            return {
                url: window.location.href || "",
                html: document.documentElement ? document.documentElement.outerHTML : ""
            };
        "#;
        let value = self.execute(script).await?;
        let url = value
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let html = value
            .get("html")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if html.is_empty() {
            return Err(ScrapeError::WebDriver("empty rendered snapshot".to_string()));
        }
        Ok((url, html))
    }

    /// Polls the rendered page until `selector` matches at least one element.
    pub async fn wait_for_all(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Vec<ElementSnapshot>> {
        let parsed = parse_selector(selector)?;
        let started = Instant::now();
        loop {
            let (page_url, html) = self.snapshot().await?;
            let found = collect_elements(&html, &page_url, &parsed);
            if !found.is_empty() {
                return Ok(found);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ScrapeError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    /// Scrolls to the bottom until the document stops growing or `stop` is set.
    pub async fn scroll_to_end(&self, pause: Duration, stop: &AtomicBool) -> Result<()> {
        let height_script = "return document.body.scrollHeight";
        let mut last_height = self.execute(height_script).await?.as_f64().unwrap_or(0.0);
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::time::sleep(pause).await;
            self.execute("window.scrollTo(0, document.body.scrollHeight);")
                .await?;
            tokio::time::sleep(pause).await;
            let new_height = self.execute(height_script).await?.as_f64().unwrap_or(0.0);
            if new_height == last_height {
                return Ok(());
            }
            last_height = new_height;
        }
    }

    pub async fn close(self) -> Result<()> {
        send_command(
            self.client.delete(format!("{}/session/{}", self.base, self.session_id)),
            "delete session",
        )
        .await?;
        Ok(())
    }
}

async fn send_command(request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
    let res = request
        .send()
        .await
        .map_err(|e| ScrapeError::WebDriver(format!("{what} request failed: {e}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| ScrapeError::WebDriver(format!("{what} response read failed: {e}")))?;
    let value: Value = serde_json::from_str(&body).unwrap_or_default();
    if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(map_webdriver_error(err, message));
    }
    if !status.is_success() {
        return Err(ScrapeError::WebDriver(format!(
            "{what} HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 240)
        )));
    }
    Ok(value)
}

fn map_webdriver_error(error: &str, message: &str) -> ScrapeError {
    match error {
        "no such element" | "stale element reference" => ScrapeError::NoSuchElement,
        "timeout" | "script timeout" => ScrapeError::Timeout,
        "invalid selector" => ScrapeError::InvalidSelector(message.to_string()),
        _ => ScrapeError::WebDriver(format!("{error}: {message}")),
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|_| ScrapeError::InvalidSelector(selector.to_string()))
}

/// Matches `selector` in `html`; `href` and `src` come back absolute, as a browser reports them.
pub fn collect_elements(html: &str, page_url: &str, selector: &Selector) -> Vec<ElementSnapshot> {
    let doc = Html::parse_document(html);
    doc.select(selector)
        .map(|el| {
            let attrs = el
                .value()
                .attrs()
                .map(|(name, value)| {
                    let value = if matches!(name, "href" | "src") {
                        resolve_href(page_url, value).unwrap_or_else(|| value.to_string())
                    } else {
                        value.to_string()
                    };
                    (name.to_string(), value)
                })
                .collect::<HashMap<_, _>>();
            ElementSnapshot { attrs }
        })
        .collect()
}

fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("data:")
    {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

fn webdriver_capabilities(browser: BrowserArg, headless: bool) -> Value {
    match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            let mut firefox_options = json!({ "args": args });
            if let Some(binary) = detect_browser_binary(BrowserArg::Firefox) {
                firefox_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": firefox_options
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            args.push("--disable-gpu".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            let mut chrome_options = json!({ "args": args });
            if let Some(binary) = detect_browser_binary(BrowserArg::Chrome) {
                chrome_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": chrome_options
                    }
                }
            })
        }
    }
}

fn detect_browser_binary(browser: BrowserArg) -> Option<PathBuf> {
    let env_key = match browser {
        BrowserArg::Firefox => "FIREFOX_BIN",
        BrowserArg::Chrome => "CHROME_BIN",
    };
    if let Ok(v) = std::env::var(env_key) {
        let p = PathBuf::from(v);
        if p.exists() {
            return Some(p);
        }
    }
    match browser {
        BrowserArg::Firefox => {
            #[cfg(target_os = "macos")]
            {
                let p = PathBuf::from("/Applications/Firefox.app/Contents/MacOS/firefox");
                if p.exists() {
                    return Some(p);
                }
            }
            which_binary_path("firefox")
        }
        BrowserArg::Chrome => {
            #[cfg(target_os = "macos")]
            {
                let p =
                    PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
                if p.exists() {
                    return Some(p);
                }
            }
            which_binary_path("google-chrome").or_else(|| which_binary_path("chrome"))
        }
    }
}

fn which_binary_path(name: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let p = PathBuf::from(path.trim());
    if p.exists() { Some(p) } else { None }
}

/// A driver binary launched for this run; killed when dropped.
pub struct DriverProcess {
    child: Child,
    endpoint: String,
}

impl DriverProcess {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Starts a WebDriver for `browser` on a free local port and waits until it accepts connections.
pub async fn launch_driver(
    run: &RunArgs,
    tx: &UnboundedSender<HarvestEvent>,
) -> Result<DriverProcess> {
    let driver_binary = match &run.driver_path {
        Some(path) => path.clone(),
        None => locate_driver_binary(run.browser, tx).await?,
    };
    let port = find_free_local_port()?;
    let endpoint = format!("http://127.0.0.1:{port}");
    let log_path = webdriver_log_path(port)?;

    let mut cmd = Command::new(&driver_binary);
    configure_webdriver_command(&mut cmd, run.browser, port);
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    let log_file_err = log_file.try_clone()?;
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());

    let mut child = cmd.spawn().map_err(|e| {
        ScrapeError::Driver(format!("failed to spawn {}: {e}", driver_binary.display()))
    })?;

    let steps = (run.driver_start_timeout_ms / 200).max(1);
    for _ in 0..steps {
        if webdriver_reachable(&endpoint) {
            send_status(
                tx,
                format!("WebDriver {} started at {endpoint}", driver_binary.display()),
            );
            return Ok(DriverProcess { child, endpoint });
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut msg = format!(
                "{} exited early with status {status} (log: {})",
                driver_binary.display(),
                log_path.display()
            );
            if let Some(tail) = read_log_tail(&log_path, 30) {
                msg = format!("{msg}; tail: {tail}");
            }
            return Err(ScrapeError::Driver(msg));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    let mut msg = format!(
        "{} did not become ready in time (log: {})",
        driver_binary.display(),
        log_path.display()
    );
    if let Some(tail) = read_log_tail(&log_path, 30) {
        msg = format!("{msg}; tail: {tail}");
    }
    Err(ScrapeError::Driver(msg))
}

async fn locate_driver_binary(
    browser: BrowserArg,
    tx: &UnboundedSender<HarvestEvent>,
) -> Result<PathBuf> {
    match browser {
        BrowserArg::Firefox => {
            if let Some(path) = which_binary_path("geckodriver") {
                return Ok(path);
            }
            ensure_geckodriver_bundle(tx).await
        }
        BrowserArg::Chrome => which_binary_path("chromedriver").ok_or_else(|| {
            ScrapeError::Driver(
                "chromedriver not found on PATH; pass --driver-path".to_string(),
            )
        }),
    }
}

fn configure_webdriver_command(cmd: &mut Command, browser: BrowserArg, port: u16) {
    match browser {
        BrowserArg::Firefox => {
            cmd.arg("--port").arg(port.to_string());
        }
        BrowserArg::Chrome => {
            cmd.arg(format!("--port={port}"));
            cmd.arg("--log-level=SEVERE");
        }
    }
}

pub fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

fn find_free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn webdriver_cache_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        return Ok(Path::new(&home).join(".cache/reaper/webdriver"));
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        return Ok(Path::new(&profile).join(".cache/reaper/webdriver"));
    }
    Err(ScrapeError::Driver(
        "cannot determine home directory for webdriver cache".to_string(),
    ))
}

fn webdriver_log_path(port: u16) -> Result<PathBuf> {
    let cache_dir = webdriver_cache_dir()?;
    fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir.join(format!("webdriver-{port}.log")))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let tail = text
        .lines()
        .rev()
        .take(lines.max(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

async fn ensure_geckodriver_bundle(tx: &UnboundedSender<HarvestEvent>) -> Result<PathBuf> {
    let platform = geckodriver_platform().ok_or_else(|| {
        ScrapeError::Driver("unsupported OS/arch for bundled geckodriver".to_string())
    })?;
    let cache_dir = webdriver_cache_dir()?;
    fs::create_dir_all(&cache_dir)?;
    let driver_binary = cache_dir.join(geckodriver_leaf_name());
    if driver_binary.exists() {
        clear_quarantine_if_macos(&driver_binary);
        return Ok(driver_binary);
    }

    send_status(tx, "downloading bundled webdriver (geckodriver)");

    let release_url = "https://api.github.com/repos/mozilla/geckodriver/releases/latest";
    let client = reqwest::Client::builder().build()?;
    let release: GithubRelease = client
        .get(release_url)
        .header(reqwest::header::USER_AGENT, "reaper/webdriver")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let asset = release
        .assets
        .iter()
        .find(|a| a.name.contains(platform) && !a.name.ends_with(".asc"))
        .ok_or_else(|| {
            ScrapeError::Driver(format!(
                "no geckodriver asset for {platform} in {}",
                release.tag_name
            ))
        })?;

    let archive_bytes = client
        .get(&asset.browser_download_url)
        .header(reqwest::header::USER_AGENT, "reaper/webdriver")
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    if asset.name.ends_with(".zip") {
        extract_binary_from_zip(&archive_bytes, &driver_binary, geckodriver_leaf_name())?;
    } else if asset.name.ends_with(".tar.gz") {
        extract_binary_from_targz(&archive_bytes, &driver_binary, geckodriver_leaf_name())?;
    } else {
        return Err(ScrapeError::Driver(format!(
            "unsupported geckodriver archive format: {}",
            asset.name
        )));
    }

    set_executable_if_needed(&driver_binary)?;
    clear_quarantine_if_macos(&driver_binary);
    send_status(
        tx,
        format!(
            "geckodriver {} cached at {}",
            release.tag_name,
            driver_binary.display()
        ),
    );
    Ok(driver_binary)
}

fn geckodriver_platform() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => Some("macos-aarch64"),
        ("macos", "x86_64") => Some("macos.tar.gz"),
        ("linux", "x86_64") => Some("linux64"),
        ("linux", "aarch64") => Some("linux-aarch64"),
        ("windows", "x86_64") => Some("win64"),
        _ => None,
    }
}

fn geckodriver_leaf_name() -> &'static str {
    if cfg!(windows) {
        "geckodriver.exe"
    } else {
        "geckodriver"
    }
}

fn extract_binary_from_zip(zip_bytes: &[u8], target: &Path, leaf_name: &str) -> Result<()> {
    let reader = std::io::Cursor::new(zip_bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| ScrapeError::Driver(format!("zip open failed: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ScrapeError::Driver(format!("zip entry failed: {e}")))?;
        let file_name_matches = Path::new(file.name())
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n == leaf_name)
            .unwrap_or(false);
        if file_name_matches {
            let mut out = File::create(target)?;
            std::io::copy(&mut file, &mut out)?;
            return Ok(());
        }
    }

    Err(ScrapeError::Driver(format!("{leaf_name} not found in archive")))
}

fn extract_binary_from_targz(archive_bytes: &[u8], target: &Path, leaf_name: &str) -> Result<()> {
    let cursor = std::io::Cursor::new(archive_bytes);
    let gz = flate2::read::GzDecoder::new(cursor);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries()? {
        let mut file = entry?;
        let path = file.path()?.to_path_buf();
        let file_name_matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n == leaf_name)
            .unwrap_or(false);
        if file_name_matches {
            let mut out = File::create(target)?;
            std::io::copy(&mut file, &mut out)?;
            return Ok(());
        }
    }

    Err(ScrapeError::Driver(format!("{leaf_name} not found in archive")))
}

fn set_executable_if_needed(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn clear_quarantine_if_macos(path: &Path) {
    #[cfg(target_os = "macos")]
    {
        let _ = Command::new("xattr")
            .arg("-dr")
            .arg("com.apple.quarantine")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(target_os = "macos"))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicU64;

    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    async fn mock_session(server: &MockServer) -> WebDriverSession {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .mount(server)
            .await;
        WebDriverSession::create(&server.uri(), BrowserArg::Firefox, true)
            .await
            .unwrap()
    }

    /// Reports a page that grows by 1000px on every height read, up to `limit` reads.
    struct GrowingHeight {
        reads: AtomicU64,
        limit: u64,
    }

    impl Respond for GrowingHeight {
        fn respond(&self, _: &Request) -> ResponseTemplate {
            let read = self.reads.fetch_add(1, Ordering::SeqCst).min(self.limit);
            ResponseTemplate::new(200).set_body_json(json!({ "value": read * 1000 }))
        }
    }

    async fn mount_scrolling(server: &MockServer, limit: u64) {
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .and(body_string_contains("return document.body.scrollHeight"))
            .respond_with(GrowingHeight {
                reads: AtomicU64::new(0),
                limit,
            })
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .and(body_string_contains("window.scrollTo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(server)
            .await;
    }

    fn snapshot_body(url: &str, html: &str) -> Value {
        json!({ "value": { "url": url, "html": html } })
    }

    #[tokio::test]
    async fn create_session_reads_session_id() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        assert_eq!(session.session_id(), "s1");
    }

    #[tokio::test]
    async fn navigate_posts_target_url() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .and(body_partial_json(json!({ "url": "https://site.test/list" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        session.navigate("https://site.test/list").await.unwrap();
    }

    #[tokio::test]
    async fn driver_errors_map_to_scrape_errors() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "script timeout", "message": "slow", "stacktrace": "" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "unknown error", "message": "net::ERR", "stacktrace": "" }
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            session.execute("return 1").await,
            Err(ScrapeError::Timeout)
        ));
        assert!(matches!(
            session.navigate("https://site.test/").await,
            Err(ScrapeError::WebDriver(msg)) if msg == "unknown error: net::ERR"
        ));
        assert!(matches!(
            map_webdriver_error("no such element", "gone"),
            ScrapeError::NoSuchElement
        ));
        assert!(matches!(
            map_webdriver_error("stale element reference", "detached"),
            ScrapeError::NoSuchElement
        ));
        assert!(matches!(
            map_webdriver_error("invalid selector", "a["),
            ScrapeError::InvalidSelector(_)
        ));
    }

    #[tokio::test]
    async fn wait_for_all_returns_resolved_attributes() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        let html = r#"<html><body>
            <a class="black-link" href="/used-cars/1">one</a>
            <a class="black-link" href="https://other.test/2">two</a>
            <a class="plain" href="/skip">skip</a>
        </body></html>"#;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(snapshot_body("https://site.test/used-cars/search", html)),
            )
            .mount(&server)
            .await;

        let found = session
            .wait_for_all("a.black-link", Duration::from_millis(100))
            .await
            .unwrap();
        let hrefs = found
            .iter()
            .filter_map(|el| el.attr("href"))
            .collect::<Vec<_>>();
        assert_eq!(
            hrefs,
            vec!["https://site.test/used-cars/1", "https://other.test/2"]
        );
    }

    #[tokio::test]
    async fn wait_for_all_times_out_when_nothing_matches() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_body(
                "https://site.test/",
                "<html><body><p>empty</p></body></html>",
            )))
            .mount(&server)
            .await;

        let result = session
            .wait_for_all("img.img-main", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ScrapeError::Timeout)));
    }

    #[tokio::test]
    async fn wait_for_all_rejects_invalid_selector() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        let result = session
            .wait_for_all("a[", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ScrapeError::InvalidSelector(_))));
    }

    #[tokio::test]
    async fn close_deletes_session() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        session.close().await.unwrap();
    }

    #[test]
    fn collect_elements_keeps_alt_and_resolves_src() {
        let selector = parse_selector("img").unwrap();
        let html = r#"<img src="plate/1.png" alt="Dubai A 123"><img alt="no source">"#;
        let found = collect_elements(html, "https://www.numbers.ae/", &selector);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].attr("src"), Some("https://www.numbers.ae/plate/1.png"));
        assert_eq!(found[0].attr("alt"), Some("Dubai A 123"));
        assert_eq!(found[1].attr("src"), None);
    }

    #[tokio::test]
    async fn scroll_stops_when_height_settles() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        mount_scrolling(&server, 3).await;

        let stop = AtomicBool::new(false);
        session
            .scroll_to_end(Duration::from_millis(1), &stop)
            .await
            .unwrap();

        let scrolls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|req| String::from_utf8_lossy(&req.body).contains("window.scrollTo"))
            .count();
        assert_eq!(scrolls, 4);
    }

    #[tokio::test]
    async fn scroll_returns_early_once_stop_is_set() {
        let server = MockServer::start().await;
        let session = mock_session(&server).await;
        mount_scrolling(&server, 40).await;

        let stop = AtomicBool::new(true);
        session
            .scroll_to_end(Duration::from_millis(1), &stop)
            .await
            .unwrap();

        let executes = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|req| req.url.path() == "/session/s1/execute/sync")
            .count();
        assert_eq!(executes, 1);
    }

    #[test]
    fn zip_extraction_finds_driver_binary() {
        let payload = b"MZ fake gecko";
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("geckodriver.exe", options).unwrap();
        writer.write_all(payload).unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("driver.exe");
        extract_binary_from_zip(&archive, &target, "geckodriver.exe").unwrap();
        assert_eq!(fs::read(&target).unwrap(), payload);

        let missing = extract_binary_from_zip(&archive, &target, "geckodriver");
        assert!(matches!(missing, Err(ScrapeError::Driver(_))));
    }

    #[test]
    fn targz_extraction_finds_driver_binary() {
        let mut tar_builder = tar::Builder::new(Vec::new());
        let payload = b"#!/bin/sh\necho gecko\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        tar_builder
            .append_data(&mut header, "geckodriver", &payload[..])
            .unwrap();
        let tar_bytes = tar_builder.into_inner().unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let archive = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("driver");
        extract_binary_from_targz(&archive, &target, "geckodriver").unwrap();
        assert_eq!(fs::read(&target).unwrap(), payload);

        let missing = extract_binary_from_targz(&archive, &target, "chromedriver");
        assert!(matches!(missing, Err(ScrapeError::Driver(_))));
    }

    #[test]
    fn reachability_requires_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(webdriver_reachable(&format!("http://127.0.0.1:{port}")));
        assert!(!webdriver_reachable("not a url"));
    }
}
