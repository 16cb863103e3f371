//! Course Record extraction from the rendered achievements page.
//!
//! All structural assumptions about the page live here, behind the
//! `RawEntry` contract: if the platform reshuffles its markup, this is the
//! only module that notices.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::config::MAX_EMPTY_ADVANCES;
use crate::error::ExtractionError;
use crate::model::RawEntry;
use crate::session::RecordPage;

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.segments-table").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub entries: Vec<RawEntry>,
    /// Rows present on the page but dropped for having too few cells.
    pub skipped_rows: usize,
    pub pages_visited: u32,
}

/// One full extraction pass over the listing. Advances pages until two
/// consecutive advances yield no entry we haven't already seen, which guards
/// against both normal exhaustion and a pager that loops.
pub async fn extract<P: RecordPage>(page: &mut P) -> Result<ExtractionOutcome, ExtractionError> {
    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut skipped_rows = 0usize;
    let mut empty_advances = 0u32;
    let mut pages_visited = 0u32;

    loop {
        let Some(html) = page.advance().await? else {
            break;
        };
        pages_visited += 1;

        let parsed = parse_page(&html, pages_visited == 1)?;
        skipped_rows += parsed.skipped;

        let mut new_on_page = 0usize;
        for entry in parsed.entries {
            if seen.insert(entry_key(&entry)) {
                entries.push(entry);
                new_on_page += 1;
            }
        }

        if new_on_page == 0 {
            empty_advances += 1;
            if empty_advances >= MAX_EMPTY_ADVANCES {
                break;
            }
        } else {
            empty_advances = 0;
        }
    }

    info!(
        "Extracted {} course records over {} pages ({} rows skipped)",
        entries.len(),
        pages_visited,
        skipped_rows
    );
    Ok(ExtractionOutcome {
        entries,
        skipped_rows,
        pages_visited,
    })
}

struct PageEntries {
    entries: Vec<RawEntry>,
    skipped: usize,
}

fn parse_page(html: &str, first_page: bool) -> Result<PageEntries, ExtractionError> {
    let document = Html::parse_document(html);

    let Some(table) = document.select(&TABLE_SEL).next() else {
        // No table on the very first page means we never reached the
        // listing (logged out, redirected). Later pages just ran off the
        // end of the pager.
        if first_page {
            return Err(ExtractionError::TableMissing);
        }
        return Ok(PageEntries {
            entries: Vec::new(),
            skipped: 0,
        });
    };

    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for row in table.select(&ROW_SEL) {
        let cells: Vec<_> = row.select(&CELL_SEL).collect();
        // Header rows select zero <td>; those aren't data we skipped.
        if cells.is_empty() {
            continue;
        }
        if cells.len() < 6 {
            warn!("Skipping row with {} cells (expected 6)", cells.len());
            skipped += 1;
            continue;
        }

        let name_cell = &cells[1];
        let time_cell = &cells[4];
        entries.push(RawEntry {
            segment_type: cell_text(&cells[0]),
            name: cell_text(name_cell),
            link: first_href(name_cell),
            distance_text: cell_text(&cells[2]),
            elevation_text: cell_text(&cells[3]),
            time_text: cell_text(time_cell),
            time_link: first_href(time_cell),
            date_text: cell_text(&cells[5]),
        });
    }

    Ok(PageEntries { entries, skipped })
}

fn cell_text(cell: &scraper::ElementRef) -> String {
    cell.text().collect::<Vec<_>>().join("").trim().to_string()
}

fn first_href(cell: &scraper::ElementRef) -> Option<String> {
    cell.select(&LINK_SEL)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

/// Identity of a row for cross-page dedup; the segment link when present,
/// otherwise name + date.
fn entry_key(entry: &RawEntry) -> String {
    match &entry.link {
        Some(link) => link.clone(),
        None => format!("{}|{}", entry.name, entry.date_text),
    }
}

// ── Tests ──
