pub mod controller;
pub mod search;

pub use controller::DriverController;
pub use search::{AvailabilityFilter, NearbyDrivers, PriorityFilter, SearchFilters, SEARCH_LIMIT};
