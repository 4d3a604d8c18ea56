use once_cell::sync::Lazy;
use std::env;

pub static SEARCH_URL: Lazy<String> = Lazy::new(|| {
    env::var("TRACKING_SEARCH_URL")
        .unwrap_or_else(|_| "https://api.gettnship.com/v2/tracking/search".to_string())
});

pub static BUY_URL: Lazy<String> = Lazy::new(|| {
    env::var("TRACKING_BUY_URL")
        .unwrap_or_else(|_| "https://api.gettnship.com/v2/tracking/buy".to_string())
});
