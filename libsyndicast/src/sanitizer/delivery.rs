//! Caption-or-split delivery selection

use super::visible_len;

/// How a sanitized body is delivered alongside its media
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPlan {
    /// No media: one text message
    TextOnly { text: String },
    /// Media with the text as caption
    Captioned { caption: String },
    /// Media without caption, followed by the text as its own message
    MediaThenText { text: String },
}

/// Pick a delivery strategy for `text` given the platform's caption limit
///
/// The limit applies to what a reader sees, so markup does not count
/// against it.
pub fn plan_delivery(text: &str, has_media: bool, caption_limit: usize) -> DeliveryPlan {
    if !has_media {
        return DeliveryPlan::TextOnly {
            text: text.to_string(),
        };
    }

    if visible_len(text) <= caption_limit {
        DeliveryPlan::Captioned {
            caption: text.to_string(),
        }
    } else {
        DeliveryPlan::MediaThenText {
            text: text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_without_media() {
        assert_eq!(
            plan_delivery("hello", false, 3),
            DeliveryPlan::TextOnly {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_caption_at_threshold() {
        let text = "a".repeat(1024);
        assert!(matches!(
            plan_delivery(&text, true, 1024),
            DeliveryPlan::Captioned { .. }
        ));
    }

    #[test]
    fn test_long_text_split_from_media() {
        let text = "a".repeat(1025);
        assert_eq!(
            plan_delivery(&text, true, 1024),
            DeliveryPlan::MediaThenText { text }
        );
    }

    #[test]
    fn test_markup_not_counted() {
        let text = format!("<b>{}</b> &amp;", "a".repeat(8));
        assert!(matches!(
            plan_delivery(&text, true, 10),
            DeliveryPlan::Captioned { .. }
        ));
    }
}
