use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use regex::Regex;

use super::error::{Result, ScrapeError};

pub const OPENSOOQ_DEFAULT_BASE: &str = "https://sa.opensooq.com/en/cars/cars-for-sale";
pub const YALLAMOTOR_DEFAULT_BASE: &str = "https://oman.yallamotor.com/used-cars/";
pub const NUMBERS_AE_DEFAULT_BASE: &str = "https://www.numbers.ae/plate";

const OPENSOOQ_ANCHOR: &str =
    "a.p-16.blackColor.radius-8.grayHoverBg.ripple.boxShadow2.relative.block";
const OPENSOOQ_IMAGE: &str = "img.image-gallery-thumbnail-image";
const YALLAMOTOR_ANCHOR: &str = "a.black-link";
const YALLAMOTOR_IMAGE: &str = "img.img-main";

/// Thumbnails come back at 240px high; the same path serves the full image.
const OPENSOOQ_THUMB_SEGMENT: &str = "/0x240/";
const OPENSOOQ_FULL_SEGMENT: &str = "/2048x0/";

pub const PLATE_IMAGE_SELECTOR: &str = "img";
pub const PLATE_SRC_MARKER: &str = "/plate/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    Opensooq,
    Yallamotor,
}

impl ListingKind {
    pub fn label(self) -> &'static str {
        match self {
            ListingKind::Opensooq => "opensooq",
            ListingKind::Yallamotor => "yallamotor",
        }
    }
}

/// A paginated search-results site whose item pages carry an image gallery.
#[derive(Debug, Clone)]
pub struct ListingSite {
    pub kind: ListingKind,
    pub base_url: String,
    pub name: String,
    pub start_page: u32,
    pub n_pages: u32,
}

impl ListingSite {
    /// Pages visited, in order. The range includes `start_page + n_pages`.
    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start_page..=self.start_page.saturating_add(self.n_pages)
    }

    pub fn page_count(&self) -> usize {
        self.n_pages as usize + 1
    }

    pub fn page_url(&self, page: u32) -> String {
        match self.kind {
            ListingKind::Opensooq => {
                if page > 1 {
                    format!("{}?page={page}", self.base_url)
                } else {
                    self.base_url.clone()
                }
            }
            ListingKind::Yallamotor => {
                if page > 1 {
                    format!("{}search?page={page}&sort=updated_desc", self.base_url)
                } else {
                    format!("{}search?sort=updated_desc", self.base_url)
                }
            }
        }
    }

    pub fn anchor_selector(&self) -> &'static str {
        match self.kind {
            ListingKind::Opensooq => OPENSOOQ_ANCHOR,
            ListingKind::Yallamotor => YALLAMOTOR_ANCHOR,
        }
    }

    pub fn image_selector(&self) -> &'static str {
        match self.kind {
            ListingKind::Opensooq => OPENSOOQ_IMAGE,
            ListingKind::Yallamotor => YALLAMOTOR_IMAGE,
        }
    }

    pub fn rewrite_image_src(&self, src: String) -> String {
        match self.kind {
            ListingKind::Opensooq => src.replace(OPENSOOQ_THUMB_SEGMENT, OPENSOOQ_FULL_SEGMENT),
            ListingKind::Yallamotor => src,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emirate {
    Dubai,
    AbuDhabi,
    Ajman,
    UmmAlQuwain,
    RasAlKhaimah,
    Sharjah,
    Fujairah,
}

impl Emirate {
    pub const ALL: [Emirate; 7] = [
        Emirate::Dubai,
        Emirate::AbuDhabi,
        Emirate::Ajman,
        Emirate::UmmAlQuwain,
        Emirate::RasAlKhaimah,
        Emirate::Sharjah,
        Emirate::Fujairah,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Emirate::Dubai => "Dubai",
            Emirate::AbuDhabi => "Abu-Dhabi",
            Emirate::Ajman => "Ajman",
            Emirate::UmmAlQuwain => "Umm-Al-Quwain",
            Emirate::RasAlKhaimah => "Ras-Al-Khaimah",
            Emirate::Sharjah => "Sharjah",
            Emirate::Fujairah => "Fujairah",
        }
    }

    /// Value of the site's `AddSearch[emirate]` query parameter.
    pub fn search_code(self) -> &'static str {
        match self {
            Emirate::Dubai => "1",
            Emirate::AbuDhabi => "2",
            Emirate::Ajman => "3",
            Emirate::UmmAlQuwain => "4",
            Emirate::RasAlKhaimah => "5",
            Emirate::Sharjah => "6",
            Emirate::Fujairah => "7",
        }
    }

    pub fn plate_pattern(self) -> &'static str {
        match self {
            Emirate::AbuDhabi => r"\b\d{1,2}\s\d+\b",
            Emirate::Sharjah => r"\b[0-9]\s\d+\b",
            _ => r"\b[A-Z]\s\d+\b",
        }
    }
}

impl fmt::Display for Emirate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Emirate {
    type Err = ScrapeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Emirate::ALL
            .into_iter()
            .find(|emirate| emirate.name() == s.trim())
            .ok_or_else(|| ScrapeError::UnknownEmirate(s.to_string()))
    }
}

/// Licence plate gallery for one emirate, loaded as a single infinite-scroll page.
#[derive(Debug, Clone)]
pub struct PlateSite {
    pub base_url: String,
    pub emirate: Emirate,
    pattern: Regex,
}

impl PlateSite {
    pub fn new(base_url: impl Into<String>, emirate: Emirate) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            emirate,
            pattern: Regex::new(emirate.plate_pattern())?,
        })
    }

    pub fn url(&self) -> String {
        format!(
            "{}?AddSearch[emirate]={}",
            self.base_url,
            self.emirate.search_code()
        )
    }

    /// First plate number in `alt`, with spaces turned into dashes.
    pub fn extract_plate_text(&self, alt: &str) -> Option<String> {
        self.pattern
            .find(alt)
            .map(|m| m.as_str().replace(' ', "-"))
    }

    pub fn is_plate_src(src: &str) -> bool {
        src.contains(PLATE_SRC_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(kind: ListingKind, base: &str) -> ListingSite {
        ListingSite {
            kind,
            base_url: base.to_string(),
            name: "Oman".to_string(),
            start_page: 1,
            n_pages: 2,
        }
    }

    #[test]
    fn opensooq_first_page_has_no_query() {
        let site = listing(ListingKind::Opensooq, OPENSOOQ_DEFAULT_BASE);
        assert_eq!(site.page_url(1), OPENSOOQ_DEFAULT_BASE);
        assert_eq!(
            site.page_url(51),
            "https://sa.opensooq.com/en/cars/cars-for-sale?page=51"
        );
    }

    #[test]
    fn yallamotor_pages_keep_sort_order() {
        let site = listing(ListingKind::Yallamotor, YALLAMOTOR_DEFAULT_BASE);
        assert_eq!(
            site.page_url(1),
            "https://oman.yallamotor.com/used-cars/search?sort=updated_desc"
        );
        assert_eq!(
            site.page_url(3),
            "https://oman.yallamotor.com/used-cars/search?page=3&sort=updated_desc"
        );
    }

    #[test]
    fn page_range_includes_last_offset() {
        let mut site = listing(ListingKind::Opensooq, OPENSOOQ_DEFAULT_BASE);
        site.start_page = 51;
        site.n_pages = 20;
        let pages = site.pages().collect::<Vec<_>>();
        assert_eq!(pages.first(), Some(&51));
        assert_eq!(pages.last(), Some(&71));
        assert_eq!(pages.len(), site.page_count());
    }

    #[test]
    fn opensooq_thumbnails_are_upscaled() {
        let site = listing(ListingKind::Opensooq, OPENSOOQ_DEFAULT_BASE);
        assert_eq!(
            site.rewrite_image_src("https://opensooq-images.test/0x240/ab/cd.jpg".to_string()),
            "https://opensooq-images.test/2048x0/ab/cd.jpg"
        );
        let yalla = listing(ListingKind::Yallamotor, YALLAMOTOR_DEFAULT_BASE);
        assert_eq!(
            yalla.rewrite_image_src("https://img.test/0x240/x.jpg".to_string()),
            "https://img.test/0x240/x.jpg"
        );
    }

    #[test]
    fn emirate_names_round_trip_and_reject_unknown() {
        for emirate in Emirate::ALL {
            assert_eq!(emirate.name().parse::<Emirate>().ok(), Some(emirate));
        }
        assert!(matches!(
            "Mars".parse::<Emirate>(),
            Err(ScrapeError::UnknownEmirate(name)) if name == "Mars"
        ));
    }

    #[test]
    fn plate_url_uses_search_code() {
        let site = PlateSite::new(NUMBERS_AE_DEFAULT_BASE, Emirate::Sharjah).unwrap();
        assert_eq!(
            site.url(),
            "https://www.numbers.ae/plate?AddSearch[emirate]=6"
        );
    }

    #[test]
    fn plate_text_follows_emirate_pattern() {
        let dubai = PlateSite::new(NUMBERS_AE_DEFAULT_BASE, Emirate::Dubai).unwrap();
        assert_eq!(
            dubai.extract_plate_text("Dubai plate Q 12345 for sale").as_deref(),
            Some("Q-12345")
        );
        assert_eq!(dubai.extract_plate_text("plate 12 345"), None);

        let abu_dhabi = PlateSite::new(NUMBERS_AE_DEFAULT_BASE, Emirate::AbuDhabi).unwrap();
        assert_eq!(
            abu_dhabi.extract_plate_text("Abu Dhabi 16 7777").as_deref(),
            Some("16-7777")
        );

        let sharjah = PlateSite::new(NUMBERS_AE_DEFAULT_BASE, Emirate::Sharjah).unwrap();
        assert_eq!(
            sharjah.extract_plate_text("Sharjah 3 90210").as_deref(),
            Some("3-90210")
        );
        assert_eq!(sharjah.extract_plate_text("Sharjah A 90210"), None);
    }

    #[test]
    fn plate_src_marker() {
        assert!(PlateSite::is_plate_src("https://www.numbers.ae/plate/123.png"));
        assert!(!PlateSite::is_plate_src("https://www.numbers.ae/logo.png"));
    }
}
