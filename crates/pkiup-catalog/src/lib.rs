mod catalog;

pub use catalog::VersionCatalog;

#[cfg(test)]
mod tests;
