use serde::Deserialize;
use utoipa::ToSchema;

use crate::entity::sea_orm_active_enums::{OrderStatus, RefundStatus};

/// Pagination after defaults and bounds are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub per_page: u64,
    pub offset: u64,
}

impl Page {
    pub fn normalize(page: Option<u64>, per_page: Option<u64>) -> Self {
        let page = page.unwrap_or(1).max(1);
        let per_page = per_page.unwrap_or(20).clamp(1, 100);
        Self {
            page,
            per_page,
            offset: (page - 1) * per_page,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

// Query strings are kept flat: serde's `flatten` cannot decode numbers from
// url-encoded input.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct OrderListQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub status: Option<OrderStatus>,
    pub sort_order: Option<SortOrder>,
}

impl OrderListQuery {
    pub fn page(&self) -> Page {
        Page::normalize(self.page, self.per_page)
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefundListQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub status: Option<RefundStatus>,
}

impl RefundListQuery {
    pub fn page(&self) -> Page {
        Page::normalize(self.page, self.per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults_and_bounds() {
        assert_eq!(
            OrderListQuery::default().page(),
            Page {
                page: 1,
                per_page: 20,
                offset: 0
            }
        );
        let page = Page::normalize(Some(3), Some(500));
        assert_eq!(page.per_page, 100);
        assert_eq!(page.offset, 200);
        assert_eq!(Page::normalize(Some(0), Some(0)).page, 1);
    }
}
