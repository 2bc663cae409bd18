pub use self::prebuffered::Prebuffered;

mod prebuffered;
