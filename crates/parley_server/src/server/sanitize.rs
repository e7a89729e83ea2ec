#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::HashSet;

/// Allow-listed tags, matching what clients are prepared to render.
const ALLOWED_TAGS: &[&str] = &[
	"h4", "h5", "h6", "blockquote", "p", "a", "ul", "ol", "nl", "li", "b", "i", "strong", "em", "strike", "hr", "br",
	"div", "table", "thead", "caption", "tbody", "tr", "th", "td", "span", "img",
];

const ALLOWED_ATTRIBUTES: &[&str] = &["href", "style", "class", "src"];

/// Style properties that survive sanitization. Everything else — colors in
/// particular, which fight the client's day/night themes — is dropped.
const ALLOWED_STYLE_PROPS: &[&str] = &[
	"font-weight",
	"font-style",
	"border",
	"border-top",
	"border-right",
	"border-bottom",
	"border-left",
	"margin",
	"margin-top",
	"margin-right",
	"margin-bottom",
	"margin-left",
	"padding",
	"padding-top",
	"padding-right",
	"padding-bottom",
	"padding-left",
	"text-align",
	"display",
	"vertical-align",
	"transform",
	"transform-origin",
	"text-transform",
	"text-decoration",
];

fn looks_like_color(token: &str) -> bool {
	let lower = token.trim().to_ascii_lowercase();
	lower.starts_with('#')
		|| lower.starts_with("rgb(")
		|| lower.starts_with("rgba(")
		|| lower.starts_with("hsl(")
		|| lower.starts_with("hsla(")
}

/// Re-emit a style attribute keeping only allow-listed properties, with
/// color values stripped out of shorthand declarations.
fn filter_style(style: &str) -> String {
	let mut kept = Vec::new();

	for declaration in style.split(';') {
		let Some((prop, value)) = declaration.split_once(':') else {
			continue;
		};
		let prop = prop.trim().to_ascii_lowercase();
		if prop.ends_with("color") || !ALLOWED_STYLE_PROPS.contains(&prop.as_str()) {
			continue;
		}

		let value = value
			.split_whitespace()
			.filter(|token| !looks_like_color(token))
			.collect::<Vec<_>>()
			.join(" ");
		if value.is_empty() {
			continue;
		}

		kept.push(format!("{prop}: {value}"));
	}

	kept.join("; ")
}

/// Sanitize chat HTML: allow-listed tags and attributes, scripts removed
/// with their content, style attributes filtered through the property
/// allow-list. Content with no markup passes through untouched.
pub fn clean_html(content: &str) -> String {
	if !(content.contains('<') && content.contains('>')) {
		return content.to_string();
	}

	let tags: HashSet<&str> = ALLOWED_TAGS.iter().copied().collect();
	let attributes: HashSet<&str> = ALLOWED_ATTRIBUTES.iter().copied().collect();
	let schemes: HashSet<&str> = ["http", "https", "ftp", "mailto", "tel", "data"].into_iter().collect();

	ammonia::Builder::default()
		.tags(tags)
		.generic_attributes(attributes)
		.url_schemes(schemes)
		.attribute_filter(|_element, attribute, value| {
			if attribute == "style" {
				Some(Cow::Owned(filter_style(value)))
			} else {
				Some(Cow::Borrowed(value))
			}
		})
		.clean(content)
		.to_string()
		.trim()
		.to_string()
}

/// Truncate to the configured maximum with an ellipsis marker, never
/// splitting a UTF-8 character.
pub fn truncate_content(content: &str, max_len: usize) -> String {
	if content.len() <= max_len {
		return content.to_string();
	}

	let cut = max_len.saturating_sub(3);
	let mut end = cut;
	while end > 0 && !content.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}...", &content[..end])
}
