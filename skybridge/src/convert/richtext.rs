//! Lossless transform between HTML and plain text with byte-offset link
//! facets.

use scraper::{Html, Node};
use serde::{Deserialize, Serialize};

/// Byte-offset-indexed rich-text annotation in post text.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Facet {
    pub index: ByteSlice,
    pub features: Vec<FacetFeature>,
}

/// Half-open UTF-8 byte range into the post text.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
}

/// Result of flattening an HTML document.
#[derive(Clone, Debug, Default)]
pub struct Parsed {
    pub text: String,
    pub langs: Vec<String>,
    pub facets: Vec<Facet>,
    pub links: Vec<String>,
}

/// Flattens HTML into plain text, recording each anchor's target and the
/// byte range its visible text ends up occupying.
///
/// `invisible`-classed elements are skipped (the Fediverse convention for
/// URL ellipsis decoration), paragraphs become blank-line separators and
/// `<br>` a single newline.
pub fn parse(html: &str, lang: Option<&str>) -> Parsed {
    let fragment = Html::parse_fragment(html);

    let mut walker = Walker::default();
    walker.walk(fragment.tree.root());

    let text = walker.text.trim_end().to_owned();

    // Locate each anchor's visible text, scanning left to right so repeated
    // anchor texts resolve to distinct ranges.
    let mut facets = Vec::new();
    let mut links = Vec::new();
    let mut search_from = 0;

    for (href, anchor_text) in walker.anchors {
        if !anchor_text.is_empty()
            && let Some(offset) = text[search_from.min(text.len())..].find(&anchor_text)
        {
            let byte_start = search_from + offset;
            let byte_end = byte_start + anchor_text.len();

            facets.push(Facet {
                index: ByteSlice { byte_start, byte_end },
                features: vec![FacetFeature::Link { uri: href.clone() }],
            });

            search_from = byte_end;
        }

        links.push(href);
    }

    Parsed {
        text,
        langs: lang.map(|lang| vec![lang.to_owned()]).unwrap_or_default(),
        facets,
        links,
    }
}

#[derive(Default)]
struct Walker {
    text: String,
    anchors: Vec<(String, String)>,
}

impl Walker {
    fn walk(&mut self, node: ego_tree::NodeRef<'_, Node>) {
        for child in node.children() {
            match child.value() {
                Node::Text(text) => self.text.push_str(&text.text),
                Node::Element(element) => {
                    if element.classes().any(|class| class == "invisible") {
                        continue;
                    }

                    match element.name() {
                        "br" => self.text.push('\n'),
                        "p" => {
                            self.start_paragraph();
                            self.walk(child);
                        }
                        "a" => {
                            let start = self.text.len();
                            self.walk(child);

                            if let Some(href) = element.attr("href") {
                                let anchor_text = self.text[start..].to_owned();
                                self.anchors.push((href.to_owned(), anchor_text));
                            }
                        }
                        _ => self.walk(child),
                    }
                }
                _ => {}
            }
        }
    }

    fn start_paragraph(&mut self) {
        if !self.text.is_empty() && !self.text.ends_with("\n\n") {
            while !self.text.ends_with("\n\n") {
                self.text.push('\n');
            }
        }
    }
}

/// Renders plain text as minimal HTML: paragraphs on blank lines, `<br>` for
/// single newlines.
pub fn to_html(text: &str) -> String {
    text.split("\n\n")
        .map(|paragraph| format!("<p>{}</p>", escape_html(paragraph).replace('\n', "<br>")))
        .collect()
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }

    escaped
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn facet_offsets_for_simple_anchor() {
        let parsed = parse("<p>Visit <a href=\"https://x.y\">X Y</a>!</p>", None);

        assert_eq!(parsed.text, "Visit X Y!");
        assert_eq!(parsed.facets.len(), 1);
        assert_eq!(parsed.facets[0].index, ByteSlice { byte_start: 6, byte_end: 9 });
        assert_eq!(
            parsed.facets[0].features[0],
            FacetFeature::Link {
                uri: "https://x.y".to_owned()
            }
        );
        assert_eq!(parsed.links, vec!["https://x.y".to_owned()]);
    }

    #[test]
    fn paragraphs_become_blank_lines_and_br_a_newline() {
        let parsed = parse("<p>one</p><p>two<br>three</p>", None);
        assert_eq!(parsed.text, "one\n\ntwo\nthree");
    }

    #[test]
    fn invisible_descendants_are_skipped() {
        let parsed = parse(
            "<p><a href=\"https://long.example/path\"><span class=\"invisible\">https://</span>long.example/path</a></p>",
            None,
        );

        assert_eq!(parsed.text, "long.example/path");
        assert_eq!(parsed.facets[0].index.byte_start, 0);
        assert_eq!(parsed.facets[0].index.byte_end, "long.example/path".len());
    }

    #[test]
    fn repeated_anchor_text_resolves_left_to_right() {
        let parsed = parse(
            "<p><a href=\"https://a.example\">here</a> and <a href=\"https://b.example\">here</a></p>",
            None,
        );

        assert_eq!(parsed.text, "here and here");
        assert_eq!(parsed.facets[0].index, ByteSlice { byte_start: 0, byte_end: 4 });
        assert_eq!(parsed.facets[1].index, ByteSlice { byte_start: 9, byte_end: 13 });
    }

    #[test]
    fn facet_offsets_are_utf8_bytes() {
        let parsed = parse("<p>héllo <a href=\"https://x.y\">wörld</a></p>", None);

        // "héllo " is 7 bytes ('é' takes two).
        assert_eq!(parsed.facets[0].index.byte_start, 7);
        assert_eq!(parsed.facets[0].index.byte_end, 7 + "wörld".len());
        assert!(parsed.facets[0].index.byte_end <= parsed.text.len());
    }

    #[test]
    fn language_tag_propagates() {
        let parsed = parse("<p>hej</p>", Some("sv"));
        assert_eq!(parsed.langs, vec!["sv".to_owned()]);
    }

    #[rstest]
    #[case("Hello")]
    #[case("one\n\ntwo")]
    #[case("line\nbreak")]
    #[case("tre paragrafer\n\nmed\nradbrytning\n\nhär")]
    fn roundtrip_on_plain_content(#[case] text: &str) {
        assert_eq!(parse(&to_html(text), None).text, text);
    }

    #[test]
    fn to_html_escapes_significant_characters() {
        assert_eq!(to_html("a < b & c"), "<p>a &lt; b &amp; c</p>");
        // Escaped source survives the roundtrip too.
        assert_eq!(parse(&to_html("a < b & c"), None).text, "a < b & c");
    }

    #[test]
    fn facet_serializes_with_lexicon_tag() {
        let facet = Facet {
            index: ByteSlice { byte_start: 6, byte_end: 9 },
            features: vec![FacetFeature::Link {
                uri: "https://x.y".to_owned(),
            }],
        };

        let json = serde_json::to_value(&facet).unwrap();
        assert_eq!(json["index"]["byteStart"], 6);
        assert_eq!(json["features"][0]["$type"], "app.bsky.richtext.facet#link");
        assert_eq!(json["features"][0]["uri"], "https://x.y");
    }
}
