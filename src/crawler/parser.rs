//! HTML parser for catalog pages
//!
//! This module extracts records from the three page kinds the crawler visits:
//! - Chart pages (song metadata, chart details, creator and stabilizer)
//! - Song pages (the chart ids a song lists)
//! - Leaderboard pages (one row per ranked player)

use crate::storage::{ChartRecord, ChartStatus, PlayerRef, RankingRow, SongListing, SongRecord};
use chrono::NaiveDateTime;
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised for pages that cannot be turned into records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("malformed page: {0}")]
    Malformed(String),
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Malformed(format!("selector '{}': {:?}", css, e)))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn select_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next().map(element_text))
}

/// Parses the leading run of ASCII digits in `s`
fn leading_int(s: &str) -> Option<i64> {
    let digits: String = s.trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Parses a leading decimal number such as `180` or `222.22`
fn leading_decimal(s: &str) -> Option<f64> {
    let number: String = s
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}

/// Digits found anywhere in `s`, concatenated (`"12,345 plays"` -> `12345`)
fn all_digits(s: &str) -> Option<u64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Returns the text after the first `label` followed by `:`
///
/// Whitespace around the colon is skipped; full-width colons are accepted.
fn value_after<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let mut search = text;
    while let Some(pos) = search.find(label) {
        let rest = search[pos + label.len()..].trim_start();
        if let Some(value) = rest.strip_prefix(':').or_else(|| rest.strip_prefix('：')) {
            return Some(value.trim_start());
        }
        search = &search[pos + label.len()..];
    }
    None
}

fn value_after_any<'a>(text: &'a str, labels: &[&str]) -> Option<&'a str> {
    labels.iter().find_map(|label| value_after(text, label))
}

/// Extracts the number following `key:` in an inline script (`sid:123`)
fn script_number(script: &str, key: &str) -> Option<i64> {
    value_after(script, key).and_then(leading_int)
}

/// Extracts the numeric id from a `/accounts/user/<uid>` link
fn user_id_from_href(href: &str) -> Option<i64> {
    let (_, rest) = href.split_once("/accounts/user/")?;
    leading_int(rest)
}

/// Extracts the chart id from a `/chart/<cid>` link
fn chart_id_from_href(href: &str) -> Option<i64> {
    let (_, rest) = href.split_once("/chart/")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // Reject things like /chart/12abc
    match rest[digits.len()..].chars().next() {
        None | Some('/') | Some('?') | Some('#') => digits.parse().ok(),
        Some(_) => None,
    }
}

/// Extracts the song id from a cover url such as `.../cover/123!small`
fn sid_from_cover(url: &str) -> Option<i64> {
    let bang = url.find('!')?;
    let head = &url[..bang];
    let slash = head.rfind('/')?;
    head[slash + 1..].parse().ok()
}

/// Text of an element, skipping `em` badges and the artist span
fn title_text(title: ElementRef<'_>) -> String {
    let mut text = String::new();
    for child in title.children() {
        match child.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(el) if el.name() == "em" => {}
            Node::Element(el) if el.classes().any(|c| c == "artist") => {}
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    text.push_str(&el.text().collect::<String>());
                }
            }
            _ => {}
        }
    }
    let text = text.trim();
    text.strip_prefix('-').map(str::trim).unwrap_or(text).to_string()
}

/// Finds the player linked right after a `<span>` whose text starts with `label`
fn credited_player(document: &Html, label: &str) -> Result<Option<PlayerRef>, ParseError> {
    let spans = selector("span")?;
    let Some(span) = document
        .select(&spans)
        .find(|span| element_text(*span).starts_with(label))
    else {
        return Ok(None);
    };

    let link = span
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "a");

    Ok(link.and_then(|a| {
        let uid = a.value().attr("href").and_then(user_id_from_href)?;
        Some(PlayerRef {
            name: element_text(a),
            uid: Some(uid),
        })
    }))
}

/// Parses a chart detail page
///
/// The song id comes from the inline `window.malody` script, falling back to
/// the cover image url. A page without a song id is rejected.
///
/// # Arguments
///
/// * `html` - The page body
/// * `cid` - The chart id that was requested
///
/// # Returns
///
/// * `Ok((SongRecord, ChartRecord))` - The song and the chart on the page
/// * `Err(ParseError)` - The page lacks a song id
pub fn parse_chart_page(html: &str, cid: i64) -> Result<(SongRecord, ChartRecord), ParseError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut sid = None;
    let mut script_cid = None;
    let scripts = selector("script")?;
    for script in document.select(&scripts) {
        let text = script.text().collect::<String>();
        if text.contains("window.malody") {
            sid = script_number(&text, "sid");
            script_cid = script_number(&text, "cid");
            break;
        }
    }

    let status = select_text(root, ".song_title .title em.t2")?
        .map(|label| ChartStatus::from_label(&label))
        .unwrap_or_default();

    let title_sel = selector(".song_title .title")?;
    let title_el = document.select(&title_sel).next();
    let title = title_el.map(title_text).unwrap_or_default();
    let artist = match title_el {
        Some(el) => select_text(el, "span.artist")?.unwrap_or_default(),
        None => String::new(),
    };

    let mut version = String::new();
    let mut mode = 0u8;
    let mode_sel = selector(".song_title .mode")?;
    if let Some(mode_el) = document.select(&mode_sel).next() {
        version = select_text(mode_el, "span")?.unwrap_or_default();
        let img_sel = selector("img")?;
        if let Some(src) = mode_el
            .select(&img_sel)
            .next()
            .and_then(|img| img.value().attr("src"))
        {
            if let Some((_, rest)) = src.split_once("mode-") {
                mode = leading_int(rest)
                    .and_then(|m| u8::try_from(m).ok())
                    .unwrap_or(0);
            }
        }
    }
    let level = version
        .split_once("Lv.")
        .and_then(|(_, rest)| {
            let level: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            (!level.is_empty()).then_some(level)
        });

    let creator = credited_player(&document, "Created by:")?;
    let stabilizer = credited_player(&document, "Stabled by:")?;

    let mut sub_cid = None;
    let mut length_secs = None;
    let mut bpm = None;
    let mut last_updated = None;
    if let Some(sub) = select_text(root, ".song_title .sub")? {
        sub_cid = value_after(&sub, "ID")
            .map(|v| v.trim_start_matches('c'))
            .and_then(leading_int);
        length_secs = value_after_any(&sub, &["长度", "Length"])
            .and_then(leading_int)
            .and_then(|l| u32::try_from(l).ok());
        bpm = value_after(&sub, "BPM").and_then(leading_decimal);
        last_updated = value_after_any(&sub, &["最后更新", "Last updated"])
            .and_then(|v| v.get(..16))
            .and_then(|v| NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M").ok());
    }

    let mut counters = [0u64; 3];
    let like_sel = selector(".like_area span.l")?;
    for (slot, span) in counters.iter_mut().zip(document.select(&like_sel)) {
        *slot = all_digits(&element_text(span)).unwrap_or(0);
    }
    let [heat, donate_count, play_count] = counters;

    let cover_sel = selector(".song_title .cover")?;
    let cover_url = document
        .select(&cover_sel)
        .next()
        .and_then(|el| el.value().attr("style"))
        .and_then(|style| {
            let (_, rest) = style.split_once("url(")?;
            let (inner, _) = rest.split_once(')')?;
            Some(inner.trim_matches(|c| c == '\'' || c == '"').to_string())
        })
        .filter(|url| !url.is_empty());

    let sid = sid
        .or_else(|| cover_url.as_deref().and_then(sid_from_cover))
        .ok_or(ParseError::MissingField("sid"))?;
    let cid = sub_cid.or(script_cid).unwrap_or(cid);

    let song = SongRecord {
        sid,
        title,
        artist,
        bpm,
        length_secs,
        cover_url,
    };
    let chart = ChartRecord {
        cid,
        sid,
        version,
        level,
        mode,
        status,
        length_secs,
        heat,
        donate_count,
        play_count,
        last_updated,
        creator,
        stabilizer,
    };

    Ok((song, chart))
}

/// Parses a song page into the chart ids it lists
///
/// An empty listing is a valid result: the song simply has no charts.
pub fn parse_song_page(html: &str, sid: i64) -> SongListing {
    let document = Html::parse_document(html);

    let chart_ids: BTreeSet<i64> = Selector::parse("a[href]")
        .map(|links| {
            document
                .select(&links)
                .filter_map(|a| a.value().attr("href"))
                .filter_map(chart_id_from_href)
                .collect()
        })
        .unwrap_or_default();

    let title = Selector::parse(".song_title .title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(title_text))
        .unwrap_or_default();

    SongListing {
        sid,
        title,
        chart_ids: chart_ids.into_iter().collect(),
    }
}

/// Parses a mode leaderboard page
///
/// Top-three cards carry their rank in an `i.label top-N` class; the rest of
/// the list has an explicit rank column. Rows without a rank are dropped.
pub fn parse_player_list(html: &str) -> Result<Vec<RankingRow>, ParseError> {
    let document = Html::parse_document(html);
    let mut rows = Vec::new();

    let top_sel = selector("div.item-top")?;
    let label_sel = selector("i.label")?;
    for item in document.select(&top_sel) {
        let rank = item.select(&label_sel).next().and_then(|label| {
            label
                .value()
                .classes()
                .find_map(|c| c.strip_prefix("top-"))
                .and_then(leading_int)
        });

        // "Lv.12 - 34567" holds both level and exp
        let (level, exp) = match select_text(item, "span.lv")? {
            Some(lv) => match lv.split_once('-') {
                Some((lv, exp)) => (
                    lv.replace("Lv.", "").trim().parse().unwrap_or(0),
                    exp.trim().parse().unwrap_or(0),
                ),
                None => (lv.replace("Lv.", "").trim().parse().unwrap_or(0), 0),
            },
            None => (0, 0),
        };

        push_row(
            &mut rows,
            rank,
            select_text(item, "span.name a")?,
            level,
            exp,
            select_text(item, "span.acc")?
                .map(|a| a.replace("Acc:", "").replace('%', "")),
            select_text(item, "span.combo")?.map(|c| c.replace("Combo:", "")),
            select_text(item, "span.pc, span[class*=pc]")?,
        );
    }

    let item_sel = selector("div.item")?;
    for item in document.select(&item_sel) {
        let rank = select_text(item, "span.rank")?.and_then(|r| leading_int(&r));
        let level = select_text(item, "span.lv")?
            .and_then(|lv| lv.replace("Lv.", "").trim().parse().ok())
            .unwrap_or(0);
        let exp = select_text(item, "span.exp")?
            .and_then(|e| e.trim().parse().ok())
            .unwrap_or(0);

        push_row(
            &mut rows,
            rank,
            select_text(item, "span.name a")?,
            level,
            exp,
            select_text(item, "span.acc")?.map(|a| a.replace('%', "")),
            select_text(item, "span.combo")?,
            select_text(item, "span.pc, span[class*=pc]")?,
        );
    }

    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
fn push_row(
    rows: &mut Vec<RankingRow>,
    rank: Option<i64>,
    name: Option<String>,
    level: u32,
    exp: u64,
    accuracy: Option<String>,
    combo: Option<String>,
    play_count: Option<String>,
) {
    let Some(rank) = rank.and_then(|r| u32::try_from(r).ok()) else {
        return;
    };

    rows.push(RankingRow {
        rank,
        name: name.unwrap_or_default(),
        level,
        exp,
        accuracy: accuracy
            .and_then(|a| a.trim().parse().ok())
            .unwrap_or(0.0),
        combo: combo.and_then(|c| c.trim().parse().ok()).unwrap_or(0),
        play_count: play_count.as_deref().and_then(all_digits).unwrap_or(0),
    });
}
