use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::data_io::{
    ImageDownloader, SaveMode, listing_image_filename, plate_image_filename,
};
use super::error::{Result, ScrapeError};
use super::sites::{ListingSite, PLATE_IMAGE_SELECTOR, PlateSite};
use super::types::{HarvestEvent, HarvestPlan, ImageRecord, ImageStatus, RunArgs};
use super::webdriver::{self, DriverProcess, WebDriverSession};

pub fn send_status(tx: &UnboundedSender<HarvestEvent>, message: impl Into<String>) {
    let message = message.into();
    info!("{message}");
    let _ = tx.send(HarvestEvent::Status(message));
}

/// Logs a failed call the way every step reports it, then lets the run continue.
pub fn send_failure(tx: &UnboundedSender<HarvestEvent>, context: &str, err: &ScrapeError) {
    let line = err.log_line();
    warn!(context, "{line}");
    let _ = tx.send(HarvestEvent::Error(format!("{context}: {line}")));
}

/// One image to fetch and where it goes.
#[derive(Debug, Clone)]
struct ImageTarget {
    page: u32,
    item: usize,
    image: usize,
    source_url: String,
    image_url: String,
    path: PathBuf,
    mode: SaveMode,
}

pub struct Harvester {
    session: WebDriverSession,
    downloader: ImageDownloader,
    out_dir: PathBuf,
    short_wait: Duration,
    site_label: String,
    stop: Arc<AtomicBool>,
    tx: UnboundedSender<HarvestEvent>,
}

impl Harvester {
    pub fn new(
        session: WebDriverSession,
        downloader: ImageDownloader,
        out_dir: PathBuf,
        short_wait: Duration,
        site_label: impl Into<String>,
        stop: Arc<AtomicBool>,
        tx: UnboundedSender<HarvestEvent>,
    ) -> Self {
        Self {
            session,
            downloader,
            out_dir,
            short_wait,
            site_label: site_label.into(),
            stop,
            tx,
        }
    }

    /// Walks the plan, then closes the browser session whatever happened.
    pub async fn run(self, plan: &HarvestPlan) {
        match plan {
            HarvestPlan::Listing(site) => self.harvest_listing(site).await,
            HarvestPlan::Plates(site) => self.harvest_plates(site).await,
        }
        if let Err(err) = self.session.close().await {
            send_failure(&self.tx, "closing browser session", &err);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    async fn harvest_listing(&self, site: &ListingSite) {
        let total = site.page_count();
        for (index, page) in site.pages().enumerate() {
            if self.stop_requested() {
                send_status(&self.tx, "stop requested; ending run early");
                return;
            }
            let _ = self.tx.send(HarvestEvent::PageStarted { page, index, total });

            let page_url = site.page_url(page);
            info!(page, url = %page_url, "opening results page");
            if let Err(err) = self.session.navigate(&page_url).await {
                send_failure(&self.tx, &format!("page {page}"), &err);
                continue;
            }
            let item_urls = self
                .attribute_values(site.anchor_selector(), "href", &format!("page {page} items"))
                .await;
            let _ = self.tx.send(HarvestEvent::ItemsFound {
                page,
                count: item_urls.len(),
            });

            for (item, item_url) in item_urls.iter().enumerate() {
                if self.stop_requested() {
                    break;
                }
                debug!(page, item, url = %item_url, "opening item");
                if let Err(err) = self.session.navigate(item_url).await {
                    send_failure(&self.tx, &format!("item {item_url}"), &err);
                    continue;
                }
                let image_urls = self
                    .attribute_values(site.image_selector(), "src", &format!("images of {item_url}"))
                    .await
                    .into_iter()
                    .map(|src| site.rewrite_image_src(src));

                for (image, image_url) in image_urls.enumerate() {
                    if self.stop_requested() {
                        break;
                    }
                    let filename = listing_image_filename(&site.name, page, item, image);
                    self.save_image(ImageTarget {
                        page,
                        item,
                        image,
                        source_url: item_url.clone(),
                        image_url,
                        path: self.out_dir.join(filename),
                        mode: SaveMode::RgbJpeg,
                    })
                    .await;
                }
            }
        }
    }

    async fn harvest_plates(&self, site: &PlateSite) {
        if self.stop_requested() {
            send_status(&self.tx, "stop requested; ending run early");
            return;
        }
        let url = site.url();
        let _ = self.tx.send(HarvestEvent::PageStarted {
            page: 1,
            index: 0,
            total: 1,
        });
        info!(emirate = %site.emirate, url = %url, "opening plate gallery");
        if let Err(err) = self.session.navigate(&url).await {
            send_failure(&self.tx, "plate gallery", &err);
            return;
        }
        if let Err(err) = self.session.scroll_to_end(self.short_wait, &self.stop).await {
            send_failure(&self.tx, "scrolling plate gallery", &err);
        }
        if self.stop_requested() {
            send_status(&self.tx, "stop requested; ending run early");
            return;
        }

        let plates = match self
            .session
            .wait_for_all(PLATE_IMAGE_SELECTOR, self.short_wait)
            .await
        {
            Ok(images) => images
                .into_iter()
                .filter_map(|img| {
                    let src = img.attr("src")?;
                    if !PlateSite::is_plate_src(src) {
                        return None;
                    }
                    let plate_text = site.extract_plate_text(img.attr("alt").unwrap_or_default())?;
                    Some((plate_text, src.to_string()))
                })
                .collect::<Vec<_>>(),
            Err(err) => {
                send_failure(&self.tx, "plate images", &err);
                Vec::new()
            }
        };
        let _ = self.tx.send(HarvestEvent::ItemsFound {
            page: 1,
            count: plates.len(),
        });

        for (item, (plate_text, src)) in plates.into_iter().enumerate() {
            if self.stop_requested() {
                send_status(&self.tx, "stop requested; ending run early");
                return;
            }
            let filename = plate_image_filename(site.emirate.name(), &plate_text);
            self.save_image(ImageTarget {
                page: 1,
                item,
                image: 0,
                source_url: url.clone(),
                image_url: src,
                path: self.out_dir.join(filename),
                mode: SaveMode::Raw,
            })
            .await;
        }
    }

    /// Values of `attr` on every element matching `selector`; empty when the lookup fails.
    async fn attribute_values(&self, selector: &str, attr: &str, context: &str) -> Vec<String> {
        match self.session.wait_for_all(selector, self.short_wait).await {
            Ok(elements) => elements
                .iter()
                .filter_map(|el| el.attr(attr))
                .map(|value| value.to_string())
                .collect(),
            Err(err) => {
                send_failure(&self.tx, context, &err);
                Vec::new()
            }
        }
    }

    async fn save_image(&self, target: ImageTarget) {
        let result = self
            .downloader
            .save(&target.image_url, &target.path, target.mode)
            .await;
        let (status, bytes, error) = match result {
            Ok(bytes) => {
                debug!(path = %target.path.display(), bytes, "image saved");
                (ImageStatus::Saved, bytes, String::new())
            }
            Err(err) => {
                send_failure(&self.tx, &target.image_url, &err);
                (ImageStatus::Failed, 0, err.log_line())
            }
        };
        let _ = self.tx.send(HarvestEvent::Image(ImageRecord {
            site: self.site_label.clone(),
            page: target.page,
            item: target.item,
            image: target.image,
            source_url: target.source_url,
            image_url: target.image_url,
            path: target.path,
            status,
            bytes,
            error,
            saved_at: Utc::now().to_rfc3339(),
        }));
    }
}

/// Brings up the browser, harvests `plan` into `out_dir`, and always reports `Finished`.
///
/// Only setup failures (driver, session, HTTP client) come back as `Err`.
pub async fn run_harvest(
    run: RunArgs,
    plan: HarvestPlan,
    out_dir: PathBuf,
    stop: Arc<AtomicBool>,
    tx: UnboundedSender<HarvestEvent>,
) -> Result<()> {
    let result = harvest_with_browser(&run, &plan, &out_dir, stop, &tx).await;
    if let Err(err) = &result {
        send_failure(&tx, "run aborted", err);
    }
    let _ = tx.send(HarvestEvent::Finished);
    result
}

async fn harvest_with_browser(
    run: &RunArgs,
    plan: &HarvestPlan,
    out_dir: &Path,
    stop: Arc<AtomicBool>,
    tx: &UnboundedSender<HarvestEvent>,
) -> Result<()> {
    let driver: Option<DriverProcess> = match &run.webdriver_url {
        Some(_) => None,
        None => Some(webdriver::launch_driver(run, tx).await?),
    };
    let endpoint = match (&run.webdriver_url, &driver) {
        (Some(url), _) => url.clone(),
        (None, Some(process)) => process.endpoint().to_string(),
        (None, None) => {
            return Err(ScrapeError::Driver("no webdriver endpoint".to_string()));
        }
    };

    let downloader = ImageDownloader::new(run.verify_tls)?;
    let session = WebDriverSession::create(&endpoint, run.browser, run.headless).await?;
    send_status(
        tx,
        format!(
            "browser session {} ready; starting at {}",
            session.session_id(),
            plan.entry_url()
        ),
    );
    let harvester = Harvester::new(
        session,
        downloader,
        out_dir.to_path_buf(),
        Duration::from_secs(run.short_wait),
        plan.site_label(),
        stop,
        tx.clone(),
    );
    harvester.run(plan).await;
    drop(driver);
    send_status(tx, "browser closed");
    Ok(())
}
