mod support;

mod presence_tests;
