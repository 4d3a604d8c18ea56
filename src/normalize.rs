use crate::models::OrderRow;
use std::collections::{BTreeMap, HashMap};

/// Parse a storefront order export (header row first) into rows.
pub fn rows_from_csv(text: &str) -> Result<Vec<OrderRow>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    reader
        .deserialize::<BTreeMap<String, String>>()
        .map(|record| record.map(OrderRow::from_fields))
        .collect()
}

/// Collapse raw export rows to one row per order number.
///
/// First occurrence fixes the output position. A later duplicate replaces the
/// kept row only when the kept row has a blank zip and the duplicate does not.
/// Rows without an order number are dropped.
pub fn dedupe_orders(rows: impl IntoIterator<Item = OrderRow>) -> Vec<OrderRow> {
    let mut unique: Vec<OrderRow> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        if row.order_number.trim().is_empty() {
            continue;
        }
        match index.get(&row.order_number) {
            None => {
                index.insert(row.order_number.clone(), unique.len());
                unique.push(row);
            }
            Some(&slot) => {
                let kept_blank = unique[slot].shipping_zip.trim().is_empty();
                if kept_blank && !row.shipping_zip.trim().is_empty() {
                    unique[slot] = row;
                }
            }
        }
    }
    unique
}
