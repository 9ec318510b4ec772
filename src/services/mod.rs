pub mod cart;
pub mod checkout;
pub mod orders;
pub mod pricing;
pub mod promotions;

pub use cart::CartService;
pub use checkout::CheckoutService;
pub use orders::OrderService;
pub use promotions::PromotionService;
