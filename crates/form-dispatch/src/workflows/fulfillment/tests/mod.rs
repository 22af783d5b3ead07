mod common;
mod stamping;
