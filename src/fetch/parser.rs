//! Best-effort extraction of the main image URL from a gallery page

use std::cell::RefCell;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::Regex;
use reqwest::Url;

use super::source::FetchError;

/// Turns a fetched page into the URL of the image it shows.
///
/// Site markup is not under our control; implementations are pluggable and
/// failures are treated as "page skipped", never as a session fault.
pub trait PageParser: Send + Sync {
    fn image_url(&self, page_url: &str, html: &str) -> Result<String, FetchError>;
}

/// Default parser walking the DOM with html5ever.
///
/// Candidates, in order: `<img id="img">`, `<meta property="og:image">`,
/// then the first `<img>` whose `src` has an image extension.
pub struct HtmlImageParser {
    image_id: String,
    image_src_re: Regex,
}

#[derive(Default)]
struct Candidates {
    by_id: Option<String>,
    og_image: Option<String>,
    first_image: Option<String>,
}

impl HtmlImageParser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_image_id("img")
    }

    /// Use a different element id for the main image.
    #[must_use]
    pub fn with_image_id(image_id: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            image_src_re: Regex::new(r"(?i)\.(jpe?g|png|gif|webp|bmp)(\?.*)?$")
                .expect("Failed to compile image src regex"),
        }
    }

    fn visit(&self, node: &Handle, found: &mut Candidates) {
        if let NodeData::Element {
            ref name,
            ref attrs,
            ..
        } = node.data
        {
            match name.local.as_ref() {
                "img" => self.visit_img(attrs, found),
                "meta" if found.og_image.is_none() => {
                    let is_og = attr_value(attrs, "property")
                        .is_some_and(|p| p.eq_ignore_ascii_case("og:image"));
                    if is_og {
                        found.og_image = attr_value(attrs, "content");
                    }
                }
                _ => {}
            }
        }

        for child in node.children.borrow().iter() {
            if found.by_id.is_some() {
                return;
            }
            self.visit(child, found);
        }
    }

    fn visit_img(&self, attrs: &RefCell<Vec<html5ever::Attribute>>, found: &mut Candidates) {
        let Some(src) = attr_value(attrs, "src") else {
            return;
        };
        if attr_value(attrs, "id").as_deref() == Some(self.image_id.as_str()) {
            found.by_id = Some(src);
            return;
        }
        if found.first_image.is_none() && self.image_src_re.is_match(&src) {
            found.first_image = Some(src);
        }
    }
}

impl Default for HtmlImageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PageParser for HtmlImageParser {
    fn image_url(&self, page_url: &str, html: &str) -> Result<String, FetchError> {
        let dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut html.as_bytes())
            .map_err(|e| FetchError::parse(page_url, format!("unreadable HTML: {e}")))?;

        let mut found = Candidates::default();
        self.visit(&dom.document, &mut found);

        let src = found
            .by_id
            .or(found.og_image)
            .or(found.first_image)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FetchError::parse(page_url, "no image candidate"))?;

        resolve_url(page_url, src.trim())
    }
}

fn attr_value(attrs: &RefCell<Vec<html5ever::Attribute>>, name: &str) -> Option<String> {
    attrs
        .borrow()
        .iter()
        .find(|attr| attr.name.local.as_ref() == name)
        .map(|attr| attr.value.to_string())
}

fn resolve_url(page_url: &str, src: &str) -> Result<String, FetchError> {
    if let Ok(absolute) = Url::parse(src) {
        return Ok(absolute.to_string());
    }
    let base = Url::parse(page_url)
        .map_err(|e| FetchError::parse(page_url, format!("bad page URL: {e}")))?;
    base.join(src)
        .map(|u| u.to_string())
        .map_err(|e| FetchError::parse(page_url, format!("bad image URL {src}: {e}")))
}
