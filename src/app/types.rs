use std::collections::VecDeque;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use super::error::Result;
use super::sites::{
    Emirate, ListingKind, ListingSite, NUMBERS_AE_DEFAULT_BASE, OPENSOOQ_DEFAULT_BASE, PlateSite,
    YALLAMOTOR_DEFAULT_BASE,
};

const RECENT_RECORD_LIMIT: usize = 200;
const LOG_LIMIT: usize = 100;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "reaper",
    version,
    about = "Browser-driven listing image harvester with live CSV/JSON manifest"
)]
pub struct Cli {
    #[command(subcommand)]
    pub site: SiteCommand,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SiteCommand {
    /// Vehicle listings on opensooq
    Opensooq(OpensooqArgs),
    /// Used-car listings on yallamotor
    Yallamotor(YallamotorArgs),
    /// Licence plate gallery on numbers.ae
    NumbersAe(PlateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct OpensooqArgs {
    /// Search-results URL the page number is appended to
    #[arg(long, value_name = "URL", default_value = OPENSOOQ_DEFAULT_BASE)]
    pub base_url: String,

    /// Run name; names the output subdirectory and every file in it
    #[arg(long, default_value = "Saudi-Arabia")]
    pub name: String,

    /// First results page to scrape
    #[arg(long, value_name = "N", default_value_t = 51)]
    pub start_page: u32,

    /// Pages to scrape after the first one
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub n_pages: u32,
}

#[derive(Debug, Args, Clone)]
pub struct YallamotorArgs {
    /// Site root; `search?...` is appended for each results page
    #[arg(long, value_name = "URL", default_value = YALLAMOTOR_DEFAULT_BASE)]
    pub base_url: String,

    #[arg(long, default_value = "Oman")]
    pub name: String,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub start_page: u32,

    #[arg(long, value_name = "N", default_value_t = 20)]
    pub n_pages: u32,
}

#[derive(Debug, Args, Clone)]
pub struct PlateArgs {
    #[arg(long, value_name = "URL", default_value = NUMBERS_AE_DEFAULT_BASE)]
    pub base_url: String,

    /// Emirate whose plates are scraped
    #[arg(long, value_name = "NAME")]
    pub emirate: Emirate,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// WebDriver binary (geckodriver/chromedriver) to launch for this run
    #[arg(long, value_name = "PATH", global = true)]
    pub driver_path: Option<PathBuf>,

    /// Use an already running WebDriver endpoint instead of launching one
    #[arg(long, value_name = "URL", global = true)]
    pub webdriver_url: Option<String>,

    #[arg(long, value_enum, default_value_t = BrowserArg::Firefox, global = true)]
    pub browser: BrowserArg,

    #[arg(long, default_value_t = false, global = true)]
    pub headless: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000, global = true)]
    pub driver_start_timeout_ms: u64,

    /// Root directory for downloaded images
    #[arg(long, value_name = "DIR", default_value = "./images", global = true)]
    pub save_dir: PathBuf,

    /// Element wait and scroll pause, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 5, global = true)]
    pub short_wait: u64,

    /// Verify TLS certificates of image hosts
    #[arg(long, default_value_t = false, global = true)]
    pub verify_tls: bool,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv, global = true)]
    pub format: FileFormatArg,

    /// Manifest path; defaults to a timestamped file in the output directory
    #[arg(long, value_name = "FILE", global = true)]
    pub manifest: Option<PathBuf>,

    #[arg(long, default_value_t = false, global = true, conflicts_with = "manifest")]
    pub no_manifest: bool,

    #[arg(long, default_value_t = false, global = true)]
    pub auto_close: bool,

    #[arg(long, default_value_t = false, global = true)]
    pub no_tui: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Firefox,
    Chrome,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

/// What a run scrapes, resolved from the subcommand.
#[derive(Debug, Clone)]
pub enum HarvestPlan {
    Listing(ListingSite),
    Plates(PlateSite),
}

impl HarvestPlan {
    pub fn from_command(command: &SiteCommand) -> Result<Self> {
        Ok(match command {
            SiteCommand::Opensooq(args) => HarvestPlan::Listing(ListingSite {
                kind: ListingKind::Opensooq,
                base_url: args.base_url.clone(),
                name: args.name.clone(),
                start_page: args.start_page,
                n_pages: args.n_pages,
            }),
            SiteCommand::Yallamotor(args) => HarvestPlan::Listing(ListingSite {
                kind: ListingKind::Yallamotor,
                base_url: args.base_url.clone(),
                name: args.name.clone(),
                start_page: args.start_page,
                n_pages: args.n_pages,
            }),
            SiteCommand::NumbersAe(args) => {
                HarvestPlan::Plates(PlateSite::new(args.base_url.clone(), args.emirate)?)
            }
        })
    }

    /// Name of the per-run output subdirectory.
    pub fn run_name(&self) -> &str {
        match self {
            HarvestPlan::Listing(site) => &site.name,
            HarvestPlan::Plates(site) => site.emirate.name(),
        }
    }

    pub fn site_label(&self) -> &'static str {
        match self {
            HarvestPlan::Listing(site) => site.kind.label(),
            HarvestPlan::Plates(_) => "numbers-ae",
        }
    }

    /// First URL the browser opens.
    pub fn entry_url(&self) -> String {
        match self {
            HarvestPlan::Listing(site) => site.page_url(site.start_page),
            HarvestPlan::Plates(site) => site.url(),
        }
    }

    pub fn page_count(&self) -> usize {
        match self {
            HarvestPlan::Listing(site) => site.page_count(),
            HarvestPlan::Plates(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Saved,
    Failed,
}

impl ImageStatus {
    pub fn label(self) -> &'static str {
        match self {
            ImageStatus::Saved => "saved",
            ImageStatus::Failed => "failed",
        }
    }
}

/// One download attempt, as written to the manifest.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub site: String,
    pub page: u32,
    pub item: usize,
    pub image: usize,
    pub source_url: String,
    pub image_url: String,
    pub path: PathBuf,
    pub status: ImageStatus,
    pub bytes: usize,
    pub error: String,
    pub saved_at: String,
}

#[derive(Debug, Clone)]
pub enum HarvestEvent {
    PageStarted {
        page: u32,
        index: usize,
        total: usize,
    },
    ItemsFound {
        page: u32,
        count: usize,
    },
    Image(ImageRecord),
    Status(String),
    Error(String),
    Finished,
}

#[derive(Debug, Default)]
pub struct ProgressState {
    pub pages_total: usize,
    pub pages_started: usize,
    pub current_page: Option<u32>,
    pub items: usize,
    pub saved: usize,
    pub failed: usize,
    pub bytes: usize,
    pub records: VecDeque<ImageRecord>,
    pub status_messages: VecDeque<String>,
    pub errors: VecDeque<String>,
    pub done: bool,
}

impl ProgressState {
    pub fn new(pages_total: usize) -> Self {
        Self {
            pages_total,
            ..Self::default()
        }
    }

    pub fn push_record(&mut self, record: ImageRecord) {
        match record.status {
            ImageStatus::Saved => {
                self.saved += 1;
                self.bytes += record.bytes;
            }
            ImageStatus::Failed => self.failed += 1,
        }
        self.records.push_front(record);
        self.records.truncate(RECENT_RECORD_LIMIT);
    }

    pub fn push_status(&mut self, message: String) {
        self.status_messages.push_front(message);
        self.status_messages.truncate(LOG_LIMIT);
    }

    pub fn push_error(&mut self, message: String) {
        self.errors.push_front(message);
        self.errors.truncate(LOG_LIMIT);
    }

    /// Fraction of pages that have finished, in `0.0..=1.0`.
    pub fn page_ratio(&self) -> f64 {
        if self.done {
            return 1.0;
        }
        if self.pages_total == 0 {
            return 0.0;
        }
        let finished = self.pages_started.saturating_sub(1);
        (finished as f64 / self.pages_total as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ImageStatus, bytes: usize) -> ImageRecord {
        ImageRecord {
            site: "opensooq".to_string(),
            page: 2,
            item: 0,
            image: 1,
            source_url: "https://site.test/item".to_string(),
            image_url: "https://img.test/a.jpg".to_string(),
            path: PathBuf::from("images/x.jpg"),
            status,
            bytes,
            error: String::new(),
            saved_at: String::new(),
        }
    }

    #[test]
    fn cli_defaults_per_site() {
        let cli = Cli::try_parse_from(["reaper", "opensooq"]).unwrap();
        let plan = HarvestPlan::from_command(&cli.site).unwrap();
        let HarvestPlan::Listing(site) = plan else {
            panic!("expected listing plan");
        };
        assert_eq!(site.kind, ListingKind::Opensooq);
        assert_eq!(site.base_url, OPENSOOQ_DEFAULT_BASE);
        assert_eq!(site.name, "Saudi-Arabia");
        assert_eq!(site.start_page, 51);
        assert_eq!(site.n_pages, 20);
        assert_eq!(cli.run.short_wait, 5);
        assert_eq!(cli.run.save_dir, PathBuf::from("./images"));
        assert_eq!(cli.run.browser, BrowserArg::Firefox);
        assert!(!cli.run.verify_tls);

        let cli = Cli::try_parse_from(["reaper", "yallamotor", "--n-pages", "3"]).unwrap();
        let HarvestPlan::Listing(site) = HarvestPlan::from_command(&cli.site).unwrap() else {
            panic!("expected listing plan");
        };
        assert_eq!(site.name, "Oman");
        assert_eq!(site.start_page, 1);
        assert_eq!(site.n_pages, 3);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "reaper",
            "opensooq",
            "--no-tui",
            "--short-wait",
            "2",
            "--save-dir",
            "/tmp/out",
        ])
        .unwrap();
        assert!(cli.run.no_tui);
        assert_eq!(cli.run.short_wait, 2);
        assert_eq!(cli.run.save_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn numbers_ae_requires_known_emirate() {
        assert!(Cli::try_parse_from(["reaper", "numbers-ae"]).is_err());
        assert!(Cli::try_parse_from(["reaper", "numbers-ae", "--emirate", "Mars"]).is_err());

        let cli =
            Cli::try_parse_from(["reaper", "numbers-ae", "--emirate", "Abu-Dhabi"]).unwrap();
        let plan = HarvestPlan::from_command(&cli.site).unwrap();
        assert_eq!(plan.run_name(), "Abu-Dhabi");
        assert_eq!(plan.site_label(), "numbers-ae");
        assert_eq!(
            plan.entry_url(),
            "https://www.numbers.ae/plate?AddSearch[emirate]=2"
        );
        assert_eq!(plan.page_count(), 1);
    }

    #[test]
    fn progress_counts_saved_and_failed() {
        let mut state = ProgressState::new(3);
        state.push_record(record(ImageStatus::Saved, 100));
        state.push_record(record(ImageStatus::Failed, 0));
        state.push_record(record(ImageStatus::Saved, 50));
        assert_eq!(state.saved, 2);
        assert_eq!(state.failed, 1);
        assert_eq!(state.bytes, 150);
        assert_eq!(state.records.front().map(|r| r.bytes), Some(50));
    }

    #[test]
    fn page_ratio_tracks_finished_pages() {
        let mut state = ProgressState::new(4);
        assert_eq!(state.page_ratio(), 0.0);
        state.pages_started = 3;
        assert_eq!(state.page_ratio(), 0.5);
        state.done = true;
        assert_eq!(state.page_ratio(), 1.0);
    }
}
