use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::product::{self, Entity as ProductEntity, Model as ProductModel},
    errors::ServiceError,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewProduct {
    #[validate(length(min = 1, max = 100))]
    pub sku: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock: i32,
}

/// Product lookups and stock accounting.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn create_product(&self, input: NewProduct) -> Result<ProductModel, ServiceError> {
        input.validate()?;
        if input.price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "price cannot be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(input.sku),
            name: Set(input.name),
            price: Set(input.price),
            stock: Set(input.stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %product.id, "Product created");
        Ok(product)
    }

    pub async fn get_product(&self, id: Uuid) -> Result<ProductModel, ServiceError> {
        ProductEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    pub async fn list_products(&self) -> Result<Vec<ProductModel>, ServiceError> {
        Ok(ProductEntity::find()
            .order_by_asc(product::Column::Sku)
            .all(&*self.db)
            .await?)
    }

    /// Resolves every id or fails with `NotFound` naming the first missing one.
    pub async fn resolve_many(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProductModel>, ServiceError> {
        let found: HashMap<Uuid, ProductModel> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        if let Some(missing) = ids.iter().find(|id| !found.contains_key(id)) {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                missing
            )));
        }
        Ok(found)
    }

    /// Takes `quantity` units if that many are on hand. Returns whether the
    /// stock was taken; never drives stock negative.
    pub async fn decrement_stock<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<bool, ServiceError> {
        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(%product_id, quantity, "Insufficient stock");
        }
        Ok(result.rows_affected == 1)
    }

    /// Gives back units taken by `decrement_stock`.
    pub async fn restore_stock<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection, run_migrations};
    use rust_decimal_macros::dec;

    async fn catalog() -> CatalogService {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        CatalogService::new(Arc::new(db))
    }

    fn widget(stock: i32) -> NewProduct {
        NewProduct {
            sku: "WID-1".into(),
            name: "Widget".into(),
            price: dec!(10.00),
            stock,
        }
    }

    #[tokio::test]
    async fn decrement_never_goes_negative() {
        let catalog = catalog().await;
        let p = catalog.create_product(widget(3)).await.unwrap();

        assert!(CatalogService::decrement_stock(&*catalog.db, p.id, 2).await.unwrap());
        assert!(!CatalogService::decrement_stock(&*catalog.db, p.id, 2).await.unwrap());
        assert_eq!(catalog.get_product(p.id).await.unwrap().stock, 1);

        CatalogService::restore_stock(&*catalog.db, p.id, 2).await.unwrap();
        assert_eq!(catalog.get_product(p.id).await.unwrap().stock, 3);
    }

    #[tokio::test]
    async fn resolve_many_reports_missing_product() {
        let catalog = catalog().await;
        let p = catalog.create_product(widget(1)).await.unwrap();
        let missing = Uuid::new_v4();

        let err = catalog.resolve_many(&[p.id, missing]).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(msg) if msg.contains(&missing.to_string())));
    }

    #[tokio::test]
    async fn rejects_negative_price() {
        let catalog = catalog().await;
        let mut input = widget(1);
        input.price = dec!(-1);
        assert!(matches!(
            catalog.create_product(input).await,
            Err(ServiceError::ValidationError(_))
        ));
    }
}
