use crate::config::Config;
use crate::error::Result;
use crate::index::SimpleRng;
use crate::normalizer;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// One review row from the source JSONL dump. The upstream id field is
/// `business_id`; internally everything is keyed by restaurant.
#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    pub review_id: String,
    #[serde(rename = "business_id")]
    pub restaurant_id: String,
    pub stars: f32,
    #[serde(default)]
    pub date: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct BusinessRow {
    business_id: String,
    name: String,
    #[serde(default)]
    categories: Option<String>,
    #[serde(default)]
    review_count: i64,
}

#[derive(Debug, Clone)]
pub struct Restaurant {
    pub restaurant_id: String,
    pub name: String,
    pub reviews: Vec<Review>,
}

fn is_restaurant(categories: &str) -> bool {
    let lower = categories.to_lowercase();
    lower.contains("restaurant") && !lower.contains("hotel") && !lower.contains("cinema")
}

/// Streams the business and review dumps, picks a seeded sample of
/// qualifying restaurants, and attaches their deduplicated reviews.
/// Row scans are capped so a runaway dump cannot pin the process.
pub async fn load_restaurants(config: &Config) -> Result<Vec<Restaurant>> {
    let mut candidates: Vec<(String, String)> = Vec::new();
    let mut scanned = 0usize;
    let mut malformed = 0usize;

    let file = File::open(&config.business_path).await?;
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        scanned += 1;
        if scanned > config.max_scan_rows {
            warn!(
                cap = config.max_scan_rows,
                "business scan cap reached, stopping early"
            );
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let row: BusinessRow = match serde_json::from_str(&line) {
            Ok(row) => row,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        let categories = row.categories.as_deref().unwrap_or("");
        if !is_restaurant(categories) {
            continue;
        }
        if row.review_count < config.min_reviews_per_restaurant as i64 {
            continue;
        }
        candidates.push((row.business_id, row.name));
    }

    if malformed > 0 {
        warn!(malformed, "skipped unparseable business rows");
    }
    debug!(
        scanned,
        qualifying = candidates.len(),
        "business scan complete"
    );

    // Sort before shuffling so the sample depends only on the seed,
    // not on row order in the dump.
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rng = SimpleRng::new(config.sample_seed);
    let mut i = candidates.len();
    while i > 1 {
        i -= 1;
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        candidates.swap(i, j);
    }
    candidates.truncate(config.max_restaurants);

    let mut selected: HashMap<String, Restaurant> = candidates
        .into_iter()
        .map(|(id, name)| {
            (
                id.clone(),
                Restaurant {
                    restaurant_id: id,
                    name,
                    reviews: Vec::new(),
                },
            )
        })
        .collect();

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut attached = 0usize;
    let mut duplicates = 0usize;
    scanned = 0;
    malformed = 0;

    let file = File::open(&config.reviews_path).await?;
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        scanned += 1;
        if scanned > config.max_scan_rows {
            warn!(
                cap = config.max_scan_rows,
                "review scan cap reached, stopping early"
            );
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let review: Review = match serde_json::from_str(&line) {
            Ok(review) => review,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        let Some(restaurant) = selected.get_mut(&review.restaurant_id) else {
            continue;
        };
        let key = (
            review.restaurant_id.clone(),
            normalizer::fingerprint(&review.text),
        );
        if !seen.insert(key) {
            duplicates += 1;
            continue;
        }
        restaurant.reviews.push(review);
        attached += 1;
    }

    if malformed > 0 {
        warn!(malformed, "skipped unparseable review rows");
    }

    let mut restaurants: Vec<Restaurant> = selected
        .into_values()
        .filter(|r| !r.reviews.is_empty())
        .collect();
    restaurants.sort_by(|a, b| a.restaurant_id.cmp(&b.restaurant_id));

    info!(
        restaurants = restaurants.len(),
        reviews = attached,
        duplicates,
        "ingest complete"
    );

    Ok(restaurants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn business_line(id: &str, name: &str, categories: &str, review_count: i64) -> String {
        format!(
            r#"{{"business_id":"{id}","name":"{name}","categories":"{categories}","review_count":{review_count}}}"#
        )
    }

    fn review_line(review_id: &str, business_id: &str, stars: f32, text: &str) -> String {
        format!(
            r#"{{"review_id":"{review_id}","business_id":"{business_id}","stars":{stars},"date":"2019-06-01","text":"{text}"}}"#
        )
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.business_path = dir.join("business.jsonl").to_string_lossy().into_owned();
        config.reviews_path = dir.join("reviews.jsonl").to_string_lossy().into_owned();
        config.min_reviews_per_restaurant = 40;
        config.max_restaurants = 25;
        config
    }

    #[tokio::test]
    async fn filters_to_qualifying_restaurants() {
        let dir = tempfile::tempdir().unwrap();
        let business = [
            business_line("biz-ok", "Cafe Luna", "Restaurants, Italian", 55),
            business_line("biz-hotel", "Grand Stay", "Hotels, Restaurants", 90),
            business_line("biz-cinema", "Star Screen", "Cinema, Restaurants", 80),
            business_line("biz-small", "Tiny Bites", "Restaurants", 10),
            "not json at all".to_string(),
        ]
        .join("\n");
        std::fs::write(dir.path().join("business.jsonl"), business).unwrap();

        let reviews = [
            review_line("r1", "biz-ok", 4.0, "Great pasta and friendly staff."),
            review_line("r2", "biz-ok", 2.0, "Waited an hour for cold soup."),
            review_line("r3", "biz-hotel", 5.0, "Lovely lobby bar."),
        ]
        .join("\n");
        std::fs::write(dir.path().join("reviews.jsonl"), reviews).unwrap();

        let restaurants = load_restaurants(&test_config(dir.path())).await.unwrap();

        assert_eq!(restaurants.len(), 1);
        assert_eq!(restaurants[0].restaurant_id, "biz-ok");
        assert_eq!(restaurants[0].name, "Cafe Luna");
        assert_eq!(restaurants[0].reviews.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_review_text_collapses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("business.jsonl"),
            business_line("biz-ok", "Cafe Luna", "Restaurants", 55),
        )
        .unwrap();

        let reviews = [
            review_line("r1", "biz-ok", 4.0, "Great pasta and friendly staff."),
            review_line("r2", "biz-ok", 4.0, "Great  pasta and friendly staff."),
            review_line("r3", "biz-ok", 1.0, "Completely different complaint."),
        ]
        .join("\n");
        std::fs::write(dir.path().join("reviews.jsonl"), reviews).unwrap();

        let restaurants = load_restaurants(&test_config(dir.path())).await.unwrap();

        // whitespace-only variants share a fingerprint
        assert_eq!(restaurants[0].reviews.len(), 2);
        assert_eq!(restaurants[0].reviews[0].review_id, "r1");
    }

    #[tokio::test]
    async fn restaurants_without_reviews_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let business = [
            business_line("biz-a", "A", "Restaurants", 50),
            business_line("biz-b", "B", "Restaurants", 50),
        ]
        .join("\n");
        std::fs::write(dir.path().join("business.jsonl"), business).unwrap();
        std::fs::write(
            dir.path().join("reviews.jsonl"),
            review_line("r1", "biz-a", 3.0, "Solid lunch spot."),
        )
        .unwrap();

        let restaurants = load_restaurants(&test_config(dir.path())).await.unwrap();

        assert_eq!(restaurants.len(), 1);
        assert_eq!(restaurants[0].restaurant_id, "biz-a");
    }

    #[tokio::test]
    async fn sample_is_seeded_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let business: Vec<String> = (0..6)
            .map(|i| business_line(&format!("biz-{i}"), &format!("R{i}"), "Restaurants", 50))
            .collect();
        std::fs::write(dir.path().join("business.jsonl"), business.join("\n")).unwrap();

        let reviews: Vec<String> = (0..6)
            .map(|i| {
                review_line(
                    &format!("r{i}"),
                    &format!("biz-{i}"),
                    4.0,
                    &format!("Review text number {i} for sampling."),
                )
            })
            .collect();
        std::fs::write(dir.path().join("reviews.jsonl"), reviews.join("\n")).unwrap();

        let mut config = test_config(dir.path());
        config.max_restaurants = 3;
        config.sample_seed = 5;

        let first = load_restaurants(&config).await.unwrap();
        let second = load_restaurants(&config).await.unwrap();

        assert_eq!(first.len(), 3);
        let first_ids: Vec<&str> = first.iter().map(|r| r.restaurant_id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|r| r.restaurant_id.as_str()).collect();
        assert_eq!(first_ids, second_ids);

        let mut config_other_seed = config.clone();
        config_other_seed.sample_seed = 6;
        let third = load_restaurants(&config_other_seed).await.unwrap();
        assert_eq!(third.len(), 3);
    }

    #[tokio::test]
    async fn missing_business_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let err = load_restaurants(&config).await.unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Io(_)));
    }
}
