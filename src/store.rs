use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Success => write!(f, "success"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Vnpay,
    Cod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    /// Whole VND, not the gateway's minor units.
    pub amount: u64,
    pub order_description: String,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub create_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<BTreeMap<String, String>>,
}

/// Correlates outbound payment requests with their callbacks.
#[async_trait::async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, String>;

    /// Insert or overwrite.
    async fn put(&self, order: Order) -> Result<(), String>;

    /// Insert only if `order.order_id` is unused. Returns `false` on collision.
    async fn insert(&self, order: Order) -> Result<bool, String>;

    /// Replace the stored order only if its status is still `expected`.
    /// Returns `false` when the order is missing or the status has moved on.
    async fn compare_and_swap(
        &self,
        order_id: &str,
        expected: OrderStatus,
        new: Order,
    ) -> Result<bool, String>;
}

/// Process-local store. Orders are lost on restart.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: DashMap<String, Order>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[async_trait::async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, String> {
        Ok(self.orders.get(order_id).map(|o| o.value().clone()))
    }

    async fn put(&self, order: Order) -> Result<(), String> {
        self.orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn insert(&self, order: Order) -> Result<bool, String> {
        match self.orders.entry(order.order_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(order);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        order_id: &str,
        expected: OrderStatus,
        new: Order,
    ) -> Result<bool, String> {
        // The shard write lock is held for the whole check-and-set.
        match self.orders.get_mut(order_id) {
            Some(mut current) if current.status == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str) -> Order {
        Order {
            order_id: id.to_string(),
            amount: 10_000,
            order_description: "Thanh toan don hang".to_string(),
            payment_method: PaymentMethod::Vnpay,
            status: OrderStatus::Pending,
            create_date: "20240101070155".to_string(),
            transaction_data: None,
        }
    }

    #[tokio::test]
    async fn insert_refuses_duplicates() {
        let store = MemoryOrderStore::new();
        assert!(store.insert(order("070155")).await.unwrap());
        assert!(!store.insert(order("070155")).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_only_from_expected_status() {
        let store = MemoryOrderStore::new();
        store.put(order("070155")).await.unwrap();

        let mut done = order("070155");
        done.status = OrderStatus::Success;
        assert!(store
            .compare_and_swap("070155", OrderStatus::Pending, done.clone())
            .await
            .unwrap());

        let mut failed = order("070155");
        failed.status = OrderStatus::Failed;
        assert!(!store
            .compare_and_swap("070155", OrderStatus::Pending, failed)
            .await
            .unwrap());

        assert_eq!(store.get("070155").await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn compare_and_swap_on_missing_order() {
        let store = MemoryOrderStore::new();
        assert!(!store
            .compare_and_swap("nope", OrderStatus::Pending, order("nope"))
            .await
            .unwrap());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[test]
    fn order_serializes_camel_case() {
        let json = serde_json::to_value(order("070155")).unwrap();
        assert_eq!(json["orderId"], "070155");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["paymentMethod"], "vnpay");
        assert!(json.get("transactionData").is_none());
    }
}
