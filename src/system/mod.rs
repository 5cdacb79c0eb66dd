pub mod button;
pub mod clock;
pub mod power;
pub mod storage;

pub use button::ActionButton;
pub use clock::EspClock;
