pub mod fulfillment;

pub use fulfillment::{ShopifyClient, Storefront};
#[cfg(test)]
pub use fulfillment::ShopifyError;
