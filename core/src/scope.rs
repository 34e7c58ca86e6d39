//! Which subscribers a cycle, proration or suspension pass touches.
//!
//! Each dimension (router, zone, subscriber, collector) has an include and
//! an exclude list. A non-empty include list wins; otherwise the exclude
//! list removes; otherwise everything passes. Dimensions are ANDed.

use crate::{store::SubscriberRow, types::EntityId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub include: Vec<EntityId>,
    #[serde(default)]
    pub exclude: Vec<EntityId>,
}

impl Filter {
    fn admits(&self, value: Option<&str>) -> bool {
        if !self.include.is_empty() {
            return value.is_some_and(|v| self.include.iter().any(|i| i == v));
        }
        match value {
            Some(v) => !self.exclude.iter().any(|e| e == v),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingScope {
    #[serde(default)]
    pub routers: Filter,
    #[serde(default)]
    pub zones: Filter,
    #[serde(default)]
    pub subscribers: Filter,
    #[serde(default)]
    pub collectors: Filter,
}

impl BillingScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only_subscriber(subscriber_id: &str) -> Self {
        Self {
            subscribers: Filter {
                include: vec![subscriber_id.to_string()],
                exclude: Vec::new(),
            },
            ..Self::default()
        }
    }

    pub fn only_router(router_id: &str) -> Self {
        Self {
            routers: Filter {
                include: vec![router_id.to_string()],
                exclude: Vec::new(),
            },
            ..Self::default()
        }
    }

    pub fn excluding_subscriber(mut self, subscriber_id: &str) -> Self {
        self.subscribers.exclude.push(subscriber_id.to_string());
        self
    }

    pub fn includes(&self, s: &SubscriberRow) -> bool {
        self.routers.admits(s.router_id.as_deref())
            && self.zones.admits(s.zone_id.as_deref())
            && self.subscribers.admits(Some(&s.subscriber_id))
            && self.collectors.admits(s.collector_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubscriberStatus;
    use rust_decimal::Decimal;

    fn sub(id: &str, router: Option<&str>, collector: Option<&str>) -> SubscriberRow {
        SubscriberRow {
            subscriber_id: id.into(),
            name: id.into(),
            status: SubscriberStatus::Active,
            balance: Decimal::ZERO,
            monthly_fee: Decimal::ZERO,
            plan_id: None,
            router_id: router.map(Into::into),
            zone_id: None,
            collector_id: collector.map(Into::into),
            service_ref: id.into(),
            promise_date: None,
            broken_promise_streak: 0,
            billing_enabled: true,
            deleted_at: None,
            version: 0,
        }
    }

    #[test]
    fn empty_scope_admits_everyone() {
        let scope = BillingScope::all();
        assert!(scope.includes(&sub("a", None, None)));
        assert!(scope.includes(&sub("b", Some("r1"), Some("c1"))));
    }

    #[test]
    fn include_list_wins_over_exclude() {
        let scope = BillingScope {
            routers: Filter {
                include: vec!["r1".into()],
                exclude: vec!["r1".into()],
            },
            ..BillingScope::default()
        };
        assert!(scope.includes(&sub("a", Some("r1"), None)));
        assert!(!scope.includes(&sub("b", Some("r2"), None)));
        assert!(!scope.includes(&sub("c", None, None)));
    }

    #[test]
    fn exclude_list_removes() {
        let scope = BillingScope::all().excluding_subscriber("a");
        assert!(!scope.includes(&sub("a", None, None)));
        assert!(scope.includes(&sub("b", None, None)));
    }

    #[test]
    fn dimensions_are_anded() {
        let scope = BillingScope {
            collectors: Filter {
                include: vec!["c1".into()],
                exclude: Vec::new(),
            },
            ..BillingScope::only_router("r1")
        };
        assert!(scope.includes(&sub("a", Some("r1"), Some("c1"))));
        assert!(!scope.includes(&sub("b", Some("r1"), Some("c2"))));
        assert!(!scope.includes(&sub("c", Some("r2"), Some("c1"))));
    }
}
