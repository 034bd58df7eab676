pub mod coupons;
pub mod order_items;
pub mod orders;
pub mod payment_logs;
pub mod payment_method_settings;
pub mod payments;
pub mod products;
pub mod refunds;
pub mod sea_orm_active_enums;
pub mod shipping_details;
pub mod users;
pub mod variants;

pub use coupons::Entity as Coupons;
pub use order_items::Entity as OrderItems;
pub use orders::Entity as Orders;
pub use payment_logs::Entity as PaymentLogs;
pub use payment_method_settings::Entity as PaymentMethodSettings;
pub use payments::Entity as Payments;
pub use products::Entity as Products;
pub use refunds::Entity as Refunds;
pub use shipping_details::Entity as ShippingDetails;
pub use users::Entity as Users;
pub use variants::Entity as Variants;
