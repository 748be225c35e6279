pub mod dialogue;
