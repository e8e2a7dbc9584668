//! Behavioural scenarios for the target lifecycle.

mod lifecycle;
