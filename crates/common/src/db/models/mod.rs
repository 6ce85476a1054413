//! SeaORM entity models
//!
//! Only the page table is mapped as an entity; legislation rows are read
//! through the graph queries in the repository.

mod clic_page;

pub use clic_page::{
    Column as ClicPageColumn, Entity as ClicPageEntity, Model as ClicPage,
};
