use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use crate::error::{ExportError, Result};
use crate::site::Page;

/// One page scheduled for export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPage {
    /// Served URL path of the page.
    pub url: String,
    pub title: String,
    /// Absolute URL the browser navigates to.
    pub location: Url,
    /// Where the rendered PDF for this page is written.
    pub path: PathBuf,
}

/// Picks the pages to export and puts them in export order.
///
/// Without an order (or with an empty one) every page is exported in its
/// natural order. Otherwise only listed pages are kept, sorted by their
/// position in `order`.
pub fn select_pages<'a>(pages: &'a [Page], order: Option<&[String]>) -> Result<Vec<&'a Page>> {
    ensure_unique_pages(pages)?;

    let selected: Vec<&Page> = match order {
        None => pages.iter().collect(),
        Some(order) if order.is_empty() => pages.iter().collect(),
        Some(order) => {
            let mut positions = HashMap::with_capacity(order.len());
            for (index, entry) in order.iter().enumerate() {
                if positions.insert(entry.as_str(), index).is_some() {
                    return Err(ExportError::DuplicateOrderEntry(entry.clone()));
                }
            }

            let mut kept: Vec<(usize, &Page)> = pages
                .iter()
                .filter_map(|page| {
                    positions
                        .get(page.relative_path.as_str())
                        .map(|&index| (index, page))
                })
                .collect();
            kept.sort_by_key(|(index, _)| *index);

            if kept.len() < order.len() {
                let known: HashSet<&str> = kept.iter().map(|(_, p)| p.relative_path.as_str()).collect();
                for entry in order.iter().filter(|e| !known.contains(e.as_str())) {
                    warn!("exportPdfOrder entry '{}' does not match any page", entry);
                }
            }

            kept.into_iter().map(|(_, page)| page).collect()
        }
    };

    if selected.is_empty() {
        return Err(ExportError::NoPagesSelected);
    }

    Ok(selected)
}

fn ensure_unique_pages(pages: &[Page]) -> Result<()> {
    let mut paths = HashSet::with_capacity(pages.len());
    let mut keys = HashSet::with_capacity(pages.len());

    for page in pages {
        if !paths.insert(page.relative_path.as_str()) {
            return Err(ExportError::DuplicatePage {
                field: "relative path",
                value: page.relative_path.clone(),
            });
        }
        if !keys.insert(page.key.as_str()) {
            return Err(ExportError::DuplicatePage {
                field: "key",
                value: page.key.clone(),
            });
        }
    }

    Ok(())
}

/// Resolves each selected page against the served site and the temp directory.
pub fn build_export_pages(pages: &[&Page], base: &Url, temp_dir: &Path) -> Result<Vec<ExportPage>> {
    pages
        .iter()
        .map(|page| {
            let location = base.join(&page.path).map_err(|e| ExportError::Location {
                path: page.path.clone(),
                reason: e.to_string(),
            })?;

            Ok(ExportPage {
                url: page.path.clone(),
                title: page.title.clone(),
                location,
                path: temp_dir.join(format!("{}.pdf", page.key)),
            })
        })
        .collect()
}
