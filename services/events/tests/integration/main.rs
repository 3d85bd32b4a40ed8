mod helpers;

mod consume_test;
