use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: Uuid,
    pub store_id: Uuid,
    pub name: String,
    pub quantity: u32,
}

/// A line of an order; `quantity` is reserved from the menu item at placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub menu_item_id: Uuid,
    pub quantity: u32,
}
