//! Toolkits bundled with the binary

pub mod math;

use crate::catalog::{CatalogError, ToolCatalog};

/// Catalog served when no other toolkits are registered.
pub fn default_catalog() -> Result<ToolCatalog, CatalogError> {
    Ok(ToolCatalog::builder().add_toolkit(math::toolkit())?.build())
}
