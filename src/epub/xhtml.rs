//! Markup for the documents inside the package: episode pages, navigation,
//! legacy NCX, the OPF package document, and the vertical-writing stylesheet.

use crate::model::{EpisodeDocument, Inline, Paragraph};

pub(crate) const STYLESHEET_HREF: &str = "style/vertical.css";

pub(crate) const VERTICAL_CSS: &str = "\
html, body {
  writing-mode: vertical-rl;
  -epub-writing-mode: vertical-rl;
  -webkit-writing-mode: vertical-rl;
  text-orientation: mixed;
  -epub-text-orientation: mixed;
}
body { line-height: 1.8; }
h1 { font-size: 1.2em; margin: 0 0 0 1em; }
p { margin: 0; }
hr { border: none; border-right: 1px solid #ccc; margin: 0 1em; }
div.preface, div.afterword { font-size: 0.9em; }
";

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: &'static str,
    pub properties: Option<&'static str>,
}

/// One table-of-contents entry; `href` is relative to the package document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TocEntry {
    pub href: String,
    pub title: String,
}

pub(crate) struct PackageDocument<'a> {
    pub identifier: &'a str,
    pub title: &'a str,
    pub author: &'a str,
    pub language: &'a str,
    pub modified: &'a str,
    pub manifest: &'a [ManifestItem],
    pub spine: &'a [String],
    pub right_to_left: bool,
    pub include_ncx: bool,
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn push_paragraphs(out: &mut String, paragraphs: &[Paragraph]) {
    for paragraph in paragraphs {
        out.push_str("<p>");
        for unit in &paragraph.0 {
            match unit {
                Inline::Text(text) => out.push_str(&xml_escape(text)),
                Inline::LineBreak => out.push_str("<br/>"),
            }
        }
        out.push_str("</p>\n");
    }
}

/// Episode content document. `stylesheet` is the href relative to this document.
pub(crate) fn episode_document(
    doc: &EpisodeDocument,
    language: &str,
    stylesheet: Option<&str>,
) -> String {
    let title = xml_escape(&doc.title);
    let link = stylesheet
        .map(|href| {
            format!(
                "\n  <link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>",
                xml_escape(href)
            )
        })
        .unwrap_or_default();

    let mut body = String::new();
    if let Some(preface) = &doc.preface {
        body.push_str("<div class=\"preface\">\n");
        push_paragraphs(&mut body, preface);
        body.push_str("</div>\n<hr/>\n");
    }
    body.push_str("<div class=\"honbun\">\n");
    push_paragraphs(&mut body, &doc.body);
    body.push_str("</div>\n");
    if let Some(afterword) = &doc.afterword {
        body.push_str("<hr/>\n<div class=\"afterword\">\n");
        push_paragraphs(&mut body, afterword);
        body.push_str("</div>\n");
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>{link}
</head>
<body>
<h1>{title}</h1>
{body}</body>
</html>
"#,
        lang = xml_escape(language),
        title = title,
        link = link,
        body = body
    )
}

pub(crate) fn nav_document(book_title: &str, language: &str, entries: &[TocEntry]) -> String {
    let mut links = String::new();
    for entry in entries {
        links.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            xml_escape(&entry.href),
            xml_escape(&entry.title)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc" id="toc">
    <h1>目次</h1>
    <ol>
{links}    </ol>
  </nav>
</body>
</html>
"#,
        lang = xml_escape(language),
        title = xml_escape(book_title),
        links = links
    )
}

pub(crate) fn ncx_document(identifier: &str, book_title: &str, entries: &[TocEntry]) -> String {
    let mut nav_points = String::new();
    for (order, entry) in (1..).zip(entries) {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{order}" playOrder="{order}">
      <navLabel><text>{}</text></navLabel>
      <content src="{}"/>
    </navPoint>
"#,
            xml_escape(&entry.title),
            xml_escape(&entry.href),
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{}"/>
  </head>
  <docTitle>
    <text>{}</text>
  </docTitle>
  <navMap>
{}  </navMap>
</ncx>
"#,
        xml_escape(identifier),
        xml_escape(book_title),
        nav_points
    )
}

pub(crate) fn package_document(pkg: &PackageDocument<'_>) -> String {
    let mut manifest = String::new();
    for item in pkg.manifest {
        let properties = item
            .properties
            .map(|p| format!(" properties=\"{}\"", p))
            .unwrap_or_default();
        manifest.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
            xml_escape(&item.id),
            xml_escape(&item.href),
            item.media_type,
            properties
        ));
    }

    let mut spine = String::new();
    for idref in pkg.spine {
        spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", xml_escape(idref)));
    }
    let mut spine_attrs = String::new();
    if pkg.include_ncx {
        spine_attrs.push_str(" toc=\"ncx\"");
    }
    if pkg.right_to_left {
        spine_attrs.push_str(" page-progression-direction=\"rtl\"");
    }

    let creator = if pkg.author.trim().is_empty() {
        String::new()
    } else {
        format!("\n    <dc:creator>{}</dc:creator>", xml_escape(pkg.author))
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id" xml:lang="{lang}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">{id}</dc:identifier>
    <dc:title>{title}</dc:title>{creator}
    <dc:language>{lang}</dc:language>
    <meta property="dcterms:modified">{modified}</meta>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine{spine_attrs}>
{spine}  </spine>
</package>
"#,
        lang = xml_escape(pkg.language),
        id = xml_escape(pkg.identifier),
        title = xml_escape(pkg.title),
        creator = creator,
        modified = xml_escape(pkg.modified),
        manifest = manifest,
        spine_attrs = spine_attrs,
        spine = spine
    )
}
