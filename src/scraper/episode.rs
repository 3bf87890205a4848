//! Episode page parser. Turns the HTML of one episode (or short-story top page)
//! into an [EpisodeDocument]; never touches the network.
//!
//! Both the current (`p-novel__*`) and the legacy (`#novel_honbun`) page layouts are recognised.

use crate::model::{EpisodeDocument, Inline, Paragraph};
use crate::scraper::error::ScraperError;
use scraper::{ElementRef, Html, Node, Selector};

const BODY_SELECTORS: &[&str] = &[
    ".p-novel__text:not(.p-novel__text--preface):not(.p-novel__text--afterword)",
    "#novel_honbun",
];
const PREFACE_SELECTORS: &[&str] = &[".p-novel__text--preface", "#novel_p"];
const AFTERWORD_SELECTORS: &[&str] = &[".p-novel__text--afterword", "#novel_a"];
const EPISODE_TITLE_SELECTORS: &[&str] = &[
    ".p-novel__title--rensai",
    ".p-novel__subtitle",
    ".novel_subtitle",
];
const WORK_TITLE_SELECTORS: &[&str] = &[".p-novel__title", ".novel_title"];
const AUTHOR_SELECTORS: &[&str] = &[
    ".p-novel__author a",
    ".novel_writername a",
    ".p-novel__author",
    ".novel_writername",
];
const AUTHOR_LABELS: &[&str] = &["作者：", "作者:"];

/// Work title and author as shown in a page header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkHeader {
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
pub(crate) fn parse_selector(sel: &str) -> Result<Selector, ScraperError> {
    Selector::parse(sel).map_err(|e| ScraperError::InvalidSelector {
        selector: sel.to_string(),
        reason: e.to_string(),
    })
}

/// All elements matching the first alternative that matches anything.
fn select_all<'a>(doc: &'a Html, alternatives: &[&str]) -> Result<Vec<ElementRef<'a>>, ScraperError> {
    for sel in alternatives {
        let selector = parse_selector(sel)?;
        let found: Vec<_> = doc.select(&selector).collect();
        if !found.is_empty() {
            return Ok(found);
        }
    }
    Ok(Vec::new())
}

fn first_text(doc: &Html, alternatives: &[&str]) -> Result<Option<String>, ScraperError> {
    for sel in alternatives {
        let selector = parse_selector(sel)?;
        let text = doc
            .select(&selector)
            .next()
            .map(|e| e.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());
        if text.is_some() {
            return Ok(text);
        }
    }
    Ok(None)
}

/// Extract the work title and author from a top/index page (or short-story page).
pub fn parse_work_header(html: &str) -> Result<WorkHeader, ScraperError> {
    let doc = Html::parse_document(html);
    let title = first_text(&doc, WORK_TITLE_SELECTORS)?;
    let author = first_text(&doc, AUTHOR_SELECTORS)?.map(|a| strip_author_label(&a));
    Ok(WorkHeader { title, author })
}

fn strip_author_label(s: &str) -> String {
    let mut t = s.trim();
    for label in AUTHOR_LABELS {
        if let Some(rest) = t.strip_prefix(label) {
            t = rest.trim();
            break;
        }
    }
    t.to_string()
}

/// True when the page carries an episode body container (used to recognise short stories).
pub(crate) fn has_body(html: &str) -> Result<bool, ScraperError> {
    let doc = Html::parse_document(html);
    Ok(!select_all(&doc, BODY_SELECTORS)?.is_empty())
}

/// Parse one episode page.
///
/// The title comes from the episode heading, or the work heading on short-story pages;
/// it is empty when neither exists and the caller keeps the index-page title.
/// Preface and afterword are kept only when present and requested.
/// A page without body paragraphs is a [ScraperError::ContentStructure] error.
pub fn parse_episode(
    index: u32,
    html: &str,
    include_preface: bool,
    include_afterword: bool,
) -> Result<EpisodeDocument, ScraperError> {
    let doc = Html::parse_document(html);

    let title = match first_text(&doc, EPISODE_TITLE_SELECTORS)? {
        Some(t) => t,
        None => first_text(&doc, WORK_TITLE_SELECTORS)?.unwrap_or_default(),
    };

    let containers = select_all(&doc, BODY_SELECTORS)?;
    if containers.is_empty() {
        return Err(ScraperError::ContentStructure {
            index,
            reason: "no body container (notice or interstitial page?)".to_string(),
        });
    }
    let body: Vec<Paragraph> = containers.into_iter().flat_map(extract_paragraphs).collect();
    if body.is_empty() {
        return Err(ScraperError::ContentStructure {
            index,
            reason: "body container has no text".to_string(),
        });
    }

    let preface = if include_preface {
        optional_block(&doc, PREFACE_SELECTORS)?
    } else {
        None
    };
    let afterword = if include_afterword {
        optional_block(&doc, AFTERWORD_SELECTORS)?
    } else {
        None
    };

    Ok(EpisodeDocument {
        index,
        title,
        body,
        preface,
        afterword,
    })
}

fn optional_block(doc: &Html, alternatives: &[&str]) -> Result<Option<Vec<Paragraph>>, ScraperError> {
    let paragraphs: Vec<Paragraph> = select_all(doc, alternatives)?
        .into_iter()
        .flat_map(extract_paragraphs)
        .collect();
    Ok(if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs)
    })
}

fn is_block(name: &str) -> bool {
    matches!(name, "p" | "div")
}

fn is_discarded(name: &str) -> bool {
    matches!(name, "rp" | "rt" | "img" | "script" | "style")
}

/// Split a body container into paragraphs: each innermost block is one paragraph,
/// loose inline content is split at `<br>`.
fn extract_paragraphs(container: ElementRef<'_>) -> Vec<Paragraph> {
    let mut out = Vec::new();
    let mut loose = ParagraphBuilder::default();
    for child in container.children() {
        match child.value() {
            Node::Text(text) => loose.text(text),
            Node::Element(el) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = el.name();
                if is_block(name) {
                    loose.flush_into(&mut out);
                    if has_block_child(child_el) {
                        out.extend(extract_paragraphs(child_el));
                    } else {
                        let mut block = ParagraphBuilder::default();
                        collect_inline(child_el, &mut block);
                        block.flush_into(&mut out);
                    }
                } else if name == "br" {
                    loose.flush_into(&mut out);
                } else {
                    inline_element(child_el, &mut loose);
                }
            }
            _ => {}
        }
    }
    loose.flush_into(&mut out);
    out
}

fn has_block_child(el: ElementRef<'_>) -> bool {
    el.children()
        .filter_map(ElementRef::wrap)
        .any(|c| is_block(c.value().name()))
}

fn collect_inline(el: ElementRef<'_>, out: &mut ParagraphBuilder) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.text(text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    inline_element(child_el, out);
                }
            }
            _ => {}
        }
    }
}

fn inline_element(el: ElementRef<'_>, out: &mut ParagraphBuilder) {
    match el.value().name() {
        "br" => out.line_break(),
        "ruby" => out.text(&flatten_ruby(el)),
        name if is_discarded(name) => {}
        _ => collect_inline(el, out),
    }
}

/// `<ruby>漢字<rp>(</rp><rt>かんじ</rt><rp>)</rp></ruby>` becomes `漢字（かんじ）`.
fn flatten_ruby(ruby: ElementRef<'_>) -> String {
    let mut base = String::new();
    let mut reading = String::new();
    for child in ruby.children() {
        match child.value() {
            Node::Text(text) => base.push_str(text),
            Node::Element(el) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                match el.name() {
                    "rt" => reading.extend(child_el.text()),
                    "rp" => {}
                    _ => base.extend(child_el.text()),
                }
            }
            _ => {}
        }
    }
    let base = base.trim();
    let reading = reading.trim();
    if reading.is_empty() {
        base.to_string()
    } else {
        format!("{}（{}）", base, reading)
    }
}

#[derive(Debug, Default)]
struct ParagraphBuilder {
    units: Vec<Inline>,
}

impl ParagraphBuilder {
    fn text(&mut self, s: &str) {
        // Source newlines are layout, not content.
        let s = s.replace(['\r', '\n'], "");
        if s.is_empty() {
            return;
        }
        match self.units.last_mut() {
            Some(Inline::Text(t)) => t.push_str(&s),
            _ => self.units.push(Inline::Text(s)),
        }
    }

    fn line_break(&mut self) {
        self.units.push(Inline::LineBreak);
    }

    /// Finish the current paragraph; blank ones are dropped. Leaves the builder empty.
    fn flush_into(&mut self, out: &mut Vec<Paragraph>) {
        let mut units = std::mem::take(&mut self.units);
        while matches!(units.last(), Some(Inline::LineBreak)) {
            units.pop();
        }
        let leading = units
            .iter()
            .take_while(|u| matches!(u, Inline::LineBreak))
            .count();
        units.drain(..leading);
        // ASCII-only trim keeps full-width indentation.
        if let Some(Inline::Text(t)) = units.first_mut() {
            *t = t.trim_start_matches(|c: char| c.is_ascii_whitespace()).to_string();
        }
        if let Some(Inline::Text(t)) = units.last_mut() {
            *t = t.trim_end_matches(|c: char| c.is_ascii_whitespace()).to_string();
        }
        let paragraph = Paragraph(units);
        if !paragraph.is_blank() {
            out.push(paragraph);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURRENT_LAYOUT: &str = r#"<!DOCTYPE html><html><body>
<div class="p-novel__author">作者：<a href="https://mypage.syosetu.com/1/">山田太郎</a></div>
<h1 class="p-novel__title p-novel__title--rensai">第一話　はじまり</h1>
<div class="p-novel__body">
<div class="js-novel-text p-novel__text p-novel__text--preface"><p id="Lp1">前書きです。</p></div>
<div class="js-novel-text p-novel__text">
<p id="L1">　<ruby>漢字<rp>(</rp><rt>かんじ</rt><rp>)</rp></ruby>の本文。</p>
<p id="L2"><br /></p>
<p id="L3">二行目<br />続き</p>
<p id="L4"><img src="https://example.com/i.png" alt="挿絵" /></p>
</div>
<div class="js-novel-text p-novel__text p-novel__text--afterword"><p id="La1">後書きです。</p></div>
</div>
</body></html>"#;

    #[test]
    fn parses_current_layout_with_ruby_and_breaks() -> Result<(), ScraperError> {
        let doc = parse_episode(1, CURRENT_LAYOUT, true, true)?;
        assert_eq!(doc.index, 1);
        assert_eq!(doc.title, "第一話　はじまり");
        assert_eq!(doc.body.len(), 2, "blank and image-only paragraphs are dropped");
        assert_eq!(doc.body[0].plain_text(), "　漢字（かんじ）の本文。");
        assert_eq!(
            doc.body[1].0,
            vec![
                Inline::Text("二行目".to_string()),
                Inline::LineBreak,
                Inline::Text("続き".to_string()),
            ]
        );
        let preface = doc.preface.as_ref().map(|p| p[0].plain_text());
        assert_eq!(preface.as_deref(), Some("前書きです。"));
        let afterword = doc.afterword.as_ref().map(|p| p[0].plain_text());
        assert_eq!(afterword.as_deref(), Some("後書きです。"));
        Ok(())
    }

    #[test]
    fn preface_and_afterword_are_filtered_by_flags() -> Result<(), ScraperError> {
        let doc = parse_episode(1, CURRENT_LAYOUT, false, false)?;
        assert!(doc.preface.is_none());
        assert!(doc.afterword.is_none());
        assert_eq!(doc.body.len(), 2);
        Ok(())
    }

    #[test]
    fn parses_legacy_layout() -> Result<(), ScraperError> {
        let html = r#"<html><body>
<p class="novel_subtitle">旧レイアウト</p>
<div id="novel_p" class="novel_view"><p id="Lp1">まえがき</p></div>
<div id="novel_honbun" class="novel_view">
<p id="L1">一段落目</p>
<p id="L2">　</p>
<p id="L3">二段落目</p>
</div>
</body></html>"#;
        let doc = parse_episode(7, html, true, true)?;
        assert_eq!(doc.title, "旧レイアウト");
        let texts: Vec<String> = doc.body.iter().map(|p| p.plain_text()).collect();
        assert_eq!(texts, vec!["一段落目", "二段落目"]);
        assert_eq!(doc.preface.map(|p| p.len()), Some(1));
        assert!(doc.afterword.is_none());
        Ok(())
    }

    #[test]
    fn loose_text_splits_at_line_breaks() -> Result<(), ScraperError> {
        let html = r#"<html><body><div id="novel_honbun">一行目<br>二行目<br><br><b>三</b>行目</div></body></html>"#;
        let doc = parse_episode(1, html, true, true)?;
        let texts: Vec<String> = doc.body.iter().map(|p| p.plain_text()).collect();
        assert_eq!(texts, vec!["一行目", "二行目", "三行目"]);
        Ok(())
    }

    #[test]
    fn loose_ruby_keeps_its_reading() -> Result<(), ScraperError> {
        let html = r#"<html><body><div id="novel_honbun">前<ruby>漢字<rp>(</rp><rt>かんじ</rt><rp>)</rp></ruby>後<br>次</div></body></html>"#;
        let doc = parse_episode(1, html, true, true)?;
        let texts: Vec<String> = doc.body.iter().map(|p| p.plain_text()).collect();
        assert_eq!(texts, vec!["前漢字（かんじ）後", "次"]);
        Ok(())
    }

    #[test]
    fn nested_blocks_stay_separate_paragraphs() -> Result<(), ScraperError> {
        let html = r#"<html><body><div class="p-novel__text"><div><p>一段落</p><p>二段落</p></div><p>三段落<br>続き</p></div></body></html>"#;
        let doc = parse_episode(1, html, true, true)?;
        let texts: Vec<String> = doc.body.iter().map(|p| p.plain_text()).collect();
        assert_eq!(texts, vec!["一段落", "二段落", "三段落\n続き"]);
        Ok(())
    }

    #[test]
    fn short_story_page_uses_work_title() -> Result<(), ScraperError> {
        let html = r#"<html><body><h1 class="p-novel__title">短編の題名</h1>
<div class="js-novel-text p-novel__text"><p>本文</p></div></body></html>"#;
        let doc = parse_episode(1, html, true, true)?;
        assert_eq!(doc.title, "短編の題名");
        Ok(())
    }

    #[test]
    fn missing_body_is_a_structure_error() {
        let html = r#"<html><body><div class="notice">この小説は削除されました。</div></body></html>"#;
        match parse_episode(3, html, true, true) {
            Err(ScraperError::ContentStructure { index, .. }) => assert_eq!(index, 3),
            other => panic!("expected ContentStructure, got {:?}", other),
        }
    }

    #[test]
    fn whitespace_only_body_is_a_structure_error() {
        let html = r#"<html><body><div id="novel_honbun"><p><br></p><p> </p></div></body></html>"#;
        assert!(matches!(
            parse_episode(2, html, true, true),
            Err(ScraperError::ContentStructure { index: 2, .. })
        ));
    }

    #[test]
    fn work_header_current_and_legacy() -> Result<(), ScraperError> {
        let current = parse_work_header(CURRENT_LAYOUT)?;
        assert_eq!(current.author.as_deref(), Some("山田太郎"));
        let legacy = parse_work_header(
            r#"<html><body><p class="novel_title">作品名</p><div class="novel_writername">作者：名無し</div></body></html>"#,
        )?;
        assert_eq!(legacy.title.as_deref(), Some("作品名"));
        assert_eq!(legacy.author.as_deref(), Some("名無し"));
        Ok(())
    }

    #[test]
    fn ruby_without_reading_keeps_base() -> Result<(), ScraperError> {
        let html = r#"<html><body><div id="novel_honbun"><p><ruby><rb>傍点</rb><rt></rt></ruby>付き</p></div></body></html>"#;
        let doc = parse_episode(1, html, true, true)?;
        assert_eq!(doc.body[0].plain_text(), "傍点付き");
        Ok(())
    }
}
