pub mod fulfillment;
