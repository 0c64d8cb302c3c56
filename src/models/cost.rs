use crate::models::canonical::{ChatRequest, ImageRequest, Usage};

/// Quota ratios for one model family. `model_ratio` is quota per prompt
/// token; completion tokens cost `model_ratio * completion_ratio` each.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRatio {
    pub model_ratio: f64,
    pub completion_ratio: f64,
}

const DEFAULT_RATIO: ModelRatio = ModelRatio {
    model_ratio: 1.0,
    completion_ratio: 1.0,
};

/// Flat quota charged per generated image at ratio 1.0.
const IMAGE_QUOTA: f64 = 20_000.0;

/// Fallback ratio table. Operators price models through ratios, not
/// catalogue prices; anything not listed is charged at ratio 1.0.
///
/// IMPORTANT: More-specific patterns must come before less-specific ones
/// because matching is by substring.
pub fn model_ratio(model: &str) -> ModelRatio {
    let r = |model_ratio: f64, completion_ratio: f64| ModelRatio {
        model_ratio,
        completion_ratio,
    };
    match model {
        m if m.contains("gpt-4o-mini") => r(0.075, 4.0),
        m if m.contains("gpt-4o") => r(1.25, 4.0),
        m if m.contains("gpt-4-turbo") => r(5.0, 3.0),
        m if m.contains("gpt-4") => r(15.0, 2.0),
        m if m.contains("gpt-3.5-turbo") => r(0.25, 3.0),
        m if m.contains("claude-3-5-haiku") || m.contains("claude-3-haiku") => r(0.125, 5.0),
        m if m.contains("claude-3-opus") => r(7.5, 5.0),
        m if m.contains("claude") => r(1.5, 5.0),
        m if m.contains("dall-e-3") => r(2.0, 1.0),
        _ => DEFAULT_RATIO,
    }
}

/// Quota owed for metered usage. Any non-zero usage costs at least 1.
pub fn quota_for_usage(model: &str, usage: &Usage) -> i64 {
    if usage.prompt_tokens == 0 && usage.completion_tokens == 0 {
        return 0;
    }
    let ratio = model_ratio(model);
    let weighted = usage.prompt_tokens as f64
        + usage.completion_tokens as f64 * ratio.completion_ratio;
    ((weighted * ratio.model_ratio).ceil() as i64).max(1)
}

/// Rough token count: ~4 characters per token.
pub fn estimate_text_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Pre-call prompt token estimate, including per-message framing overhead.
pub fn estimate_prompt_tokens(req: &ChatRequest) -> u32 {
    let per_message = 4;
    let mut total = 3;
    for msg in &req.messages {
        total += per_message + estimate_text_tokens(&msg.text_content());
        if let Some(name) = &msg.name {
            total += estimate_text_tokens(name);
        }
    }
    if let Some(tools) = &req.tools {
        let encoded = serde_json::to_string(tools).unwrap_or_default();
        total += estimate_text_tokens(&encoded);
    }
    total
}

/// Quota reserved before a chat call: prompt estimate plus any requested
/// completion budget, priced, plus the configured floor.
pub fn reservation_for_chat(req: &ChatRequest, prompt_tokens: u32, floor: i64) -> i64 {
    let usage = Usage::new(prompt_tokens, req.max_tokens.unwrap_or(0));
    quota_for_usage(&req.model, &usage) + floor
}

/// Image generation is priced up front; the reservation is the final cost.
pub fn quota_for_image(req: &ImageRequest) -> i64 {
    let n = req.n.unwrap_or(1).max(1) as f64;
    let size_factor = match req.size.as_deref() {
        Some("1792x1024") | Some("1024x1792") => 2.0,
        Some("512x512") | Some("256x256") => 0.5,
        _ => 1.0,
    };
    let quality_factor = if req.quality.as_deref() == Some("hd") { 2.0 } else { 1.0 };
    (IMAGE_QUOTA * model_ratio(&req.model).model_ratio * n * size_factor * quality_factor).ceil()
        as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::Message;

    #[test]
    fn test_specific_patterns_win() {
        assert_eq!(model_ratio("gpt-4o-mini-2024-07-18").model_ratio, 0.075);
        assert_eq!(model_ratio("gpt-4o-2024-08-06").model_ratio, 1.25);
        assert_eq!(model_ratio("some-new-model"), DEFAULT_RATIO);
    }

    #[test]
    fn test_quota_for_usage() {
        // (100 + 10 * 4) * 1.25 = 175
        assert_eq!(quota_for_usage("gpt-4o", &Usage::new(100, 10)), 175);
        assert_eq!(quota_for_usage("gpt-4o", &Usage::default()), 0);
        // rounding never drops a paid call to zero
        assert_eq!(quota_for_usage("gpt-4o-mini", &Usage::new(1, 0)), 1);
    }

    #[test]
    fn test_prompt_estimate_counts_messages() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![Message::text("user", "abcdefgh"), Message::text("assistant", "abc")],
            ..Default::default()
        };
        // 3 + (4 + 2) + (4 + 1)
        assert_eq!(estimate_prompt_tokens(&req), 14);
    }

    #[test]
    fn test_reservation_includes_floor_and_max_tokens() {
        let req = ChatRequest {
            model: "unknown".into(),
            max_tokens: Some(50),
            ..Default::default()
        };
        assert_eq!(reservation_for_chat(&req, 10, 500), 560);
    }

    #[test]
    fn test_image_quota_scales_with_n_and_quality() {
        let mut req = ImageRequest {
            model: "dall-e-3".into(),
            prompt: "a cat".into(),
            n: Some(2),
            size: None,
            quality: None,
            response_format: None,
        };
        let base = quota_for_image(&req);
        req.quality = Some("hd".into());
        assert_eq!(quota_for_image(&req), base * 2);
    }
}
