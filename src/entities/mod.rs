pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod delivery_option;
pub mod gift_card;
pub mod order;
pub mod order_item;

// Re-export entities
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use coupon::{DiscountType, Entity as Coupon, Model as CouponModel};
pub use delivery_option::{Entity as DeliveryOption, Model as DeliveryOptionModel};
pub use gift_card::{Entity as GiftCard, Model as GiftCardModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus, PaymentStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
