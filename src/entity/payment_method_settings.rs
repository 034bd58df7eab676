use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::PaymentMethod;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "payment_method_settings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub method: PaymentMethod,
    pub is_enabled: bool,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
