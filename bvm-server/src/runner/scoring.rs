//! Brand extraction and visibility scoring
//!
//! Pure functions over the collected provider answers; the matcher stays a
//! black box behind [`BrandMatcher`].

use crate::collaborators::BrandMatcher;
use bvm_common::api::CompetitorScore;
use bvm_common::events::Sentiment;

/// Aggregated mention statistics for one brand across all answers
#[derive(Debug, Clone)]
pub struct BrandStats {
    pub brand: String,
    pub answers: usize,
    pub mentions: usize,
    /// Ordinal positions (1-based) where the brand was mentioned
    pub positions: Vec<u32>,
    pub sentiments: Vec<Sentiment>,
}

impl BrandStats {
    pub fn empty(brand: &str) -> Self {
        Self {
            brand: brand.to_string(),
            answers: 0,
            mentions: 0,
            positions: Vec::new(),
            sentiments: Vec::new(),
        }
    }
}

/// 1-based rank of `brand`'s first mention among all known brands in `text`
///
/// None when the brand is not mentioned at all.
pub fn ordinal_position(
    matcher: &dyn BrandMatcher,
    brand: &str,
    known_brands: &[String],
    text: &str,
) -> Option<u32> {
    let own_index = matcher.find_mention(brand, text).first_index?;
    let mut rank = 1;
    for other in known_brands {
        if other.eq_ignore_ascii_case(brand) {
            continue;
        }
        if let Some(index) = matcher.find_mention(other, text).first_index {
            if index < own_index {
                rank += 1;
            }
        }
    }
    Some(rank)
}

/// Collect mention statistics for one brand across all answers
pub fn extract_brand_stats(
    matcher: &dyn BrandMatcher,
    brand: &str,
    known_brands: &[String],
    answers: &[&str],
) -> BrandStats {
    let mut stats = BrandStats::empty(brand);
    stats.answers = answers.len();
    for text in answers {
        let mention = matcher.find_mention(brand, text);
        if mention.mentioned {
            stats.mentions += 1;
            stats.sentiments.push(mention.sentiment);
            if let Some(position) = ordinal_position(matcher, brand, known_brands, text) {
                stats.positions.push(position);
            }
        }
    }
    stats
}

/// Combine mention rate, position and sentiment into a 0-100 score
///
/// Mention rate dominates (70 points); earlier average position is worth up
/// to 20; sentiment the last 10. A brand never mentioned scores 0.
pub fn score_brand(stats: &BrandStats) -> CompetitorScore {
    if stats.answers == 0 || stats.mentions == 0 {
        return CompetitorScore {
            name: stats.brand.clone(),
            mention_rate: 0.0,
            average_position: None,
            sentiment_score: 0.0,
            visibility_score: 0.0,
        };
    }

    let mention_rate = stats.mentions as f64 / stats.answers as f64;
    let average_position = if stats.positions.is_empty() {
        None
    } else {
        Some(stats.positions.iter().map(|p| *p as f64).sum::<f64>() / stats.positions.len() as f64)
    };
    let sentiment_score = stats
        .sentiments
        .iter()
        .map(|s| match s {
            Sentiment::Positive => 1.0,
            Sentiment::Neutral => 0.0,
            Sentiment::Negative => -1.0,
        })
        .sum::<f64>()
        / stats.sentiments.len() as f64;

    let position_factor = average_position.map(|p| 1.0 / p).unwrap_or(0.0);
    let visibility_score =
        (mention_rate * 70.0 + position_factor * 20.0 + (sentiment_score + 1.0) / 2.0 * 10.0)
            .clamp(0.0, 100.0);

    CompetitorScore {
        name: stats.brand.clone(),
        mention_rate,
        average_position,
        sentiment_score,
        visibility_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::KeywordMatcher;

    fn brands(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ordinal_position_ranks_by_first_occurrence() {
        let matcher = KeywordMatcher;
        let known = brands(&["Acme", "Rival", "Other"]);
        let text = "Rival leads the market, followed by Acme. Other trails.";
        assert_eq!(ordinal_position(&matcher, "Rival", &known, text), Some(1));
        assert_eq!(ordinal_position(&matcher, "Acme", &known, text), Some(2));
        assert_eq!(ordinal_position(&matcher, "Other", &known, text), Some(3));
        assert_eq!(ordinal_position(&matcher, "Ghost", &known, text), None);
    }

    #[test]
    fn stats_count_mentions_across_answers() {
        let matcher = KeywordMatcher;
        let known = brands(&["Acme", "Rival"]);
        let answers = [
            "Acme is the best choice, better than Rival.",
            "Rival only.",
            "Nothing relevant.",
        ];
        let stats = extract_brand_stats(&matcher, "Acme", &known, &answers);
        assert_eq!(stats.answers, 3);
        assert_eq!(stats.mentions, 1);
        assert_eq!(stats.positions, vec![1]);
    }

    #[test]
    fn unmentioned_brand_scores_zero() {
        let score = score_brand(&BrandStats::empty("Ghost"));
        assert_eq!(score.visibility_score, 0.0);
        assert_eq!(score.mention_rate, 0.0);
        assert!(score.average_position.is_none());
    }

    #[test]
    fn always_first_positive_brand_scores_high() {
        let stats = BrandStats {
            brand: "Acme".into(),
            answers: 4,
            mentions: 4,
            positions: vec![1, 1, 1, 1],
            sentiments: vec![Sentiment::Positive; 4],
        };
        let score = score_brand(&stats);
        assert_eq!(score.mention_rate, 1.0);
        assert_eq!(score.average_position, Some(1.0));
        assert_eq!(score.sentiment_score, 1.0);
        assert_eq!(score.visibility_score, 100.0);
    }

    #[test]
    fn partial_visibility_scores_between_bounds() {
        let stats = BrandStats {
            brand: "Rival".into(),
            answers: 4,
            mentions: 2,
            positions: vec![2, 2],
            sentiments: vec![Sentiment::Neutral, Sentiment::Negative],
        };
        let score = score_brand(&stats);
        assert!(score.visibility_score > 0.0);
        assert!(score.visibility_score < 70.0);
        assert_eq!(score.mention_rate, 0.5);
    }
}
