pub mod assoc;
