pub mod deckhouserelease;
